//! Declarative macros to reduce boilerplate across the powerguard codebase

/// Define an enum with automatic `name()` and `all()` implementations
///
/// # Example
/// ```
/// use powerguard::named_enum;
///
/// named_enum! {
///     pub enum Source {
///         Ac => "AC",
///         Battery => "BATTERY",
///     }
/// }
///
/// let source = Source::Battery;
/// assert_eq!(source.name(), "BATTERY");
/// assert_eq!(Source::all().len(), 2);
/// ```
///
/// Expands to:
/// - An enum with Debug, Clone, Copy, PartialEq, Eq, Hash derives
/// - A `name(&self) -> &'static str` method
/// - An `all() -> Vec<Self>` method
/// - A `Display` implementation printing `name()`
#[macro_export]
macro_rules! named_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => $str:literal),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $($(#[$vmeta])* $variant,)*
        }

        impl $name {
            pub fn name(&self) -> &'static str {
                match self {
                    $($name::$variant => $str,)*
                }
            }

            pub fn all() -> Vec<$name> {
                vec![$($name::$variant,)*]
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

/// Define an enum with name() and all() methods, plus custom data per variant
///
/// # Example
/// ```
/// use powerguard::enum_with_data;
///
/// enum_with_data! {
///     pub enum Preference: u8 {
///         Performance => ("performance", 0x20),
///         Balanced => ("balanced", 0x80),
///     }
///     impl epp -> u8
/// }
///
/// let pref = Preference::Performance;
/// assert_eq!(pref.name(), "performance");
/// assert_eq!(pref.epp(), 0x20);
/// ```
#[macro_export]
macro_rules! enum_with_data {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident: $data_type:ty {
            $($variant:ident => ($str:literal, $data:expr)),* $(,)?
        }
        impl $method:ident -> $return_type:ty
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $($variant,)*
        }

        impl $name {
            pub fn name(&self) -> &'static str {
                match self {
                    $($name::$variant => $str,)*
                }
            }

            pub fn $method(&self) -> $return_type {
                match self {
                    $($name::$variant => $data,)*
                }
            }

            pub fn all() -> Vec<$name> {
                vec![$($name::$variant,)*]
            }
        }
    };
}

/// Compare a written value against its read-back and log the outcome
///
/// Evaluates to `Ok(())` on a match and to `Err(PowerguardError::RegisterIo)`
/// on a mismatch. Both values are masked before the comparison.
///
/// # Example
/// ```ignore
/// // In orchestrator::controller::ControlLoop::write_register()
/// verify_readback!("MSR_PKG_POWER_LIMIT", written, read, POWER_LIMIT_COMPARE_MASK)?;
/// ```
#[macro_export]
macro_rules! verify_readback {
    ($register:expr, $written:expr, $read:expr, $mask:expr) => {{
        let written: u64 = $written & $mask;
        let read: u64 = $read & $mask;
        if written == read {
            tracing::debug!(
                "{} - write 0x{:X} - read 0x{:X} - match OK",
                $register,
                written,
                read
            );
            Ok(())
        } else {
            tracing::debug!(
                "{} - write 0x{:X} - read 0x{:X} - match ERR",
                $register,
                written,
                read
            );
            Err($crate::error::PowerguardError::RegisterIo {
                register: $register,
                written,
                read,
            })
        }
    }};
}
