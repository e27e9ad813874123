#![macro_use]
#![allow(unused_macros)]

//! Logging shims. With the `defmt` feature the macros forward to `defmt`;
//! without it they still evaluate their arguments so call sites compile
//! either way.

macro_rules! trace {
    ($($x:tt)*) => {{
        #[cfg(feature = "defmt")]
        ::defmt::trace!($($x)*);
        #[cfg(not(feature = "defmt"))]
        let _ = ($($x)*,);
    }};
}

macro_rules! debug {
    ($($x:tt)*) => {{
        #[cfg(feature = "defmt")]
        ::defmt::debug!($($x)*);
        #[cfg(not(feature = "defmt"))]
        let _ = ($($x)*,);
    }};
}

macro_rules! info {
    ($($x:tt)*) => {{
        #[cfg(feature = "defmt")]
        ::defmt::info!($($x)*);
        #[cfg(not(feature = "defmt"))]
        let _ = ($($x)*,);
    }};
}

macro_rules! warn {
    ($($x:tt)*) => {{
        #[cfg(feature = "defmt")]
        ::defmt::warn!($($x)*);
        #[cfg(not(feature = "defmt"))]
        let _ = ($($x)*,);
    }};
}

macro_rules! error {
    ($($x:tt)*) => {{
        #[cfg(feature = "defmt")]
        ::defmt::error!($($x)*);
        #[cfg(not(feature = "defmt"))]
        let _ = ($($x)*,);
    }};
}
