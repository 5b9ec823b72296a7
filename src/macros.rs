//! Internal macros

/// Generates a closed byte-coded enum with an `Other` catch-all, so that
/// unknown values survive a decode/encode cycle untouched.
macro_rules! code_table {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident : $repr:ty {
            $( $(#[$vmeta:meta])* $variant:ident = $value:literal ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $( $(#[$vmeta])* $variant, )*
            /// A value outside the known table
            Other($repr),
        }

        impl $name {
            /// Every defined value, in table order
            pub const ALL: &'static [$name] = &[ $( $name::$variant, )* ];

            /// The wire value
            pub const fn code(self) -> $repr {
                match self {
                    $( $name::$variant => $value, )*
                    $name::Other(v) => v,
                }
            }

            /// Whether this is a value from the known table
            pub const fn is_known(self) -> bool {
                !matches!(self, $name::Other(_))
            }
        }

        impl From<$repr> for $name {
            fn from(value: $repr) -> Self {
                match value {
                    $( $value => $name::$variant, )*
                    other => $name::Other(other),
                }
            }
        }

        impl From<$name> for $repr {
            fn from(value: $name) -> Self {
                value.code()
            }
        }
    };
}
