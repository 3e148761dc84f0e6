#![allow(unused_macros)]

#[cfg(feature = "defmt-logging")]
macro_rules! drt_log {
    (trace, $($arg:expr),*) => { defmt::trace!($($arg),*) };
    (debug, $($arg:expr),*) => { defmt::debug!($($arg),*) };
    (info,  $($arg:expr),*) => { defmt::info!($($arg),*) };
    (warn,  $($arg:expr),*) => { defmt::warn!($($arg),*) };
    (error, $($arg:expr),*) => { defmt::error!($($arg),*) };
}

#[cfg(not(feature = "defmt-logging"))]
macro_rules! drt_log {
    ($level:ident, $($arg:expr),*) => {{ $( let _ = $arg; )* }}
}

macro_rules! drt_trace {
    ($($arg:expr),*) => (drt_log!(trace, $($arg),*));
}

macro_rules! drt_debug {
    ($($arg:expr),*) => (drt_log!(debug, $($arg),*));
}

macro_rules! drt_info {
    ($($arg:expr),*) => (drt_log!(info, $($arg),*));
}

macro_rules! drt_warn {
    ($($arg:expr),*) => (drt_log!(warn, $($arg),*));
}

macro_rules! drt_error {
    ($($arg:expr),*) => (drt_log!(error, $($arg),*));
}
