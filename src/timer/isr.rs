use crate::driver::DccDriver;
use core::cell::RefCell;
use critical_section::Mutex;
use embedded_hal::digital::OutputPin;

/// Used to initialize the global static `DccDriver` for use with
/// `critical_section`.
///
/// # Returns
/// * An empty mutable ref-cell
///
/// # Example
/// ```rust,ignore
/// use core::cell::RefCell;
/// use critical_section::Mutex;
/// use dccgen::driver::DccDriver;
/// use dccgen::timer::global_dcc_driver_init;
/// use some_hal::{PB1, PB4};
///
/// static DCC_DRIVER: Mutex<RefCell<Option<DccDriver<PB1, PB4, 2>>>> =
///     global_dcc_driver_init::<PB1, PB4, 2>();
/// ```
pub const fn global_dcc_driver_init<EN: OutputPin, DIR: OutputPin, const D: usize>()
-> Mutex<RefCell<Option<DccDriver<EN, DIR, D>>>> {
    Mutex::new(RefCell::new(None))
}

/// Stores a constructed driver in the global singleton.
///
/// # Arguments
/// * The global static `DccDriver` cell
/// * The driver instance to install
///
/// # Example
/// ```rust,ignore
/// fn main() {
///     let driver = DccDriver::new(districts, constants);
///     global_dcc_driver_setup(&DCC_DRIVER, driver);
/// }
/// ```
pub fn global_dcc_driver_setup<EN: OutputPin, DIR: OutputPin, const D: usize>(
    global_driver: &'static Mutex<RefCell<Option<DccDriver<EN, DIR, D>>>>,
    driver: DccDriver<EN, DIR, D>,
) {
    critical_section::with(|cs| {
        let _ = global_driver.borrow(cs).replace(Some(driver));
    });
}

/// Runs the generator tick at each timer compare-match interrupt.
///
/// # Arguments
/// * The global static `DccDriver` cell
///
/// # Example
/// ```rust,ignore
/// #[interrupt]
/// fn TIMER2_COMPA() {
///     global_dcc_timer_tick(&DCC_DRIVER);
/// }
/// ```
pub fn global_dcc_timer_tick<EN: OutputPin, DIR: OutputPin, const D: usize>(
    global_driver: &'static Mutex<RefCell<Option<DccDriver<EN, DIR, D>>>>,
) {
    critical_section::with(|cs| {
        if let Some(driver) = global_driver.borrow(cs).borrow_mut().as_mut() {
            driver.tick();
        }
    });
}

/// Hands a finished ADC conversion to the driver from the ADC interrupt.
///
/// Returns the analog channel the interrupt should switch the mux to and
/// re-arm, or `None` when the driver is not installed yet.
///
/// # Example
/// ```rust,ignore
/// #[interrupt]
/// fn ADC() {
///     let reading = read_adc_result();
///     if let Some(next) = global_dcc_adc_feed(&DCC_DRIVER, reading) {
///         select_adc_channel(next);
///     }
/// }
/// ```
pub fn global_dcc_adc_feed<EN: OutputPin, DIR: OutputPin, const D: usize>(
    global_driver: &'static Mutex<RefCell<Option<DccDriver<EN, DIR, D>>>>,
    reading: u16,
) -> Option<u8> {
    critical_section::with(|cs| {
        global_driver
            .borrow(cs)
            .borrow_mut()
            .as_mut()
            .map(|driver| driver.adc.irq(reading))
    })
}
