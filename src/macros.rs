//! Declarative helpers shared by the error table and the codec command tables.

/// Declares numeric fault codes and a `get_error_message` lookup over them.
macro_rules! define_error_codes {
    ($($name:ident = $code:expr => $msg:expr),* $(,)?) => {
        $(
            pub const $name: u32 = $code;
        )*

        /// Returns the human readable message for a fault code.
        pub fn get_error_message(code: u32) -> &'static str {
            $(
                if code == $name {
                    return $msg;
                }
            )*
            "Unknown error"
        }
    };
}

/// Declares a closed command enum together with its wire label and code.
///
/// The generated `TABLE` is what codecs turn into their lookup tables at
/// construction time; `FromStr` resolves the wire label back to a variant.
macro_rules! define_key_codes {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident : $repr:ty {
            $($variant:ident = ($label:expr, $code:expr)),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $($variant),*
        }

        impl $name {
            /// Every variant with its label and wire code, in declaration order.
            pub const TABLE: &'static [($name, &'static str, $repr)] = &[
                $(($name::$variant, $label, $code)),*
            ];

            pub fn label(self) -> &'static str {
                match self {
                    $($name::$variant => $label),*
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::error::LinkError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Self::TABLE
                    .iter()
                    .find(|(_, label, _)| *label == s)
                    .map(|(variant, _, _)| *variant)
                    .ok_or_else(|| crate::error::LinkError::UnknownCommand(s.to_string()))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.label())
            }
        }
    };
}
