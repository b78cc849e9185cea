//! Internal logging shims.
//!
//! The core logs through `defmt` or the `log` facade depending on which
//! feature is enabled, and compiles the call sites away entirely when
//! neither is. Format strings are restricted to plain `{}` captures of
//! primitive values so the same call site renders under either backend.

#[cfg(all(feature = "defmt", feature = "log"))]
compile_error!("the `defmt` and `log` features are mutually exclusive");

#[cfg(feature = "defmt")]
macro_rules! dcc_info {
    ($($arg:tt)*) => { ::defmt::info!($($arg)*) };
}
#[cfg(all(feature = "log", not(feature = "defmt")))]
macro_rules! dcc_info {
    ($($arg:tt)*) => { ::log::info!($($arg)*) };
}
#[cfg(not(any(feature = "defmt", feature = "log")))]
macro_rules! dcc_info {
    ($($arg:tt)*) => {{}};
}

#[cfg(feature = "defmt")]
macro_rules! dcc_warn {
    ($($arg:tt)*) => { ::defmt::warn!($($arg)*) };
}
#[cfg(all(feature = "log", not(feature = "defmt")))]
macro_rules! dcc_warn {
    ($($arg:tt)*) => { ::log::warn!($($arg)*) };
}
#[cfg(not(any(feature = "defmt", feature = "log")))]
macro_rules! dcc_warn {
    ($($arg:tt)*) => {{}};
}

pub(crate) use dcc_info;
pub(crate) use dcc_warn;
