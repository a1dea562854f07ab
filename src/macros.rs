//! Declarative tables shared by the protocol and error modules.

/// Defines the `CommandType` enum together with its numeric lookup.
macro_rules! define_command_type {
    ($($name:ident = $val:literal),* $(,)?) => {
        /// Tuya command codes carried in the frame header.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum CommandType {
            $($name = $val),*
        }

        impl CommandType {
            /// Look up a command by its wire code.
            pub fn from_u32(code: u32) -> Option<Self> {
                match code {
                    $($val => Some(CommandType::$name),)*
                    _ => None,
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $(CommandType::$name => stringify!($name),)*
                }
            }
        }

        impl From<CommandType> for u32 {
            fn from(cmd: CommandType) -> u32 {
                cmd as u32
            }
        }
    };
}

/// Defines the closed set of supported protocol versions.
///
/// Variants must be listed in ascending order so that the derived `Ord`
/// follows the protocol generations.
macro_rules! define_version {
    ($($name:ident = ($s:literal, $v:literal)),* $(,)?) => {
        /// Tuya local protocol version.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum Version {
            $($name),*
        }

        impl Version {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Version::$name => $s,)*
                }
            }

            /// ASCII form used in the 15-byte version header.
            pub fn as_bytes(&self) -> &'static [u8] {
                self.as_str().as_bytes()
            }
        }

        impl std::fmt::Display for Version {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for Version {
            type Err = $crate::error::TuyaError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s.trim() {
                    $($s => Ok(Version::$name),)*
                    other => Err($crate::error::TuyaError::UnsupportedVersion(other.to_string())),
                }
            }
        }

        impl TryFrom<f32> for Version {
            type Error = $crate::error::TuyaError;

            fn try_from(v: f32) -> std::result::Result<Self, Self::Error> {
                let tenths = (v * 10.0).round() as i32;
                $(
                    if tenths == ($v * 10.0f32).round() as i32 {
                        return Ok(Version::$name);
                    }
                )*
                Err($crate::error::TuyaError::UnsupportedVersion(v.to_string()))
            }
        }
    };
}

/// Defines numeric error codes and `get_error_message`.
macro_rules! define_error_codes {
    ($($name:ident = $code:literal => $msg:literal),* $(,)?) => {
        $(pub const $name: u32 = $code;)*

        /// Human readable description of a numeric error code.
        pub fn get_error_message(code: u32) -> &'static str {
            match code {
                $($code => $msg,)*
                _ => "Unknown Error",
            }
        }
    };
}
