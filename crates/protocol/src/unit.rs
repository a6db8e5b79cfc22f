use crate::Error;
use crate::error::ErrorKind;

/// The direction of a pipe, as seen from its owning node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    /// The node consumes data through the pipe.
    In = 0,
    /// The node produces data through the pipe.
    Out = 1,
    /// The pipe holds an operator-editable constant.
    Const = 2,
}

impl Direction {
    /// Convert the direction to its wire code.
    #[inline]
    pub fn into_raw(self) -> u8 {
        self as u8
    }

    /// Convert a wire code to a `Direction`.
    #[inline]
    pub fn from_raw(raw: u8) -> Result<Self, Error> {
        match raw {
            0 => Ok(Direction::In),
            1 => Ok(Direction::Out),
            2 => Ok(Direction::Const),
            raw => Err(Error::new(ErrorKind::UnknownDirection(raw))),
        }
    }
}

/// The element type carried by a pipe.
///
/// # Examples
///
/// ```
/// use protocol::Unit;
///
/// assert_eq!(Unit::Int16.size(), 2);
/// assert_eq!(Unit::Int16.into_raw(), 4);
/// assert_eq!(Unit::from_raw(4)?, Unit::Int16);
/// # Ok::<_, protocol::Error>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Unit {
    Char = 1,
    Bool = 2,
    Int8 = 3,
    Int16 = 4,
    Int32 = 5,
    Int64 = 6,
    Uint8 = 7,
    Uint16 = 8,
    Uint32 = 9,
    Uint64 = 10,
    Float = 11,
    Double = 12,
}

impl Unit {
    /// Convert the unit to its wire code.
    #[inline]
    pub fn into_raw(self) -> u8 {
        self as u8
    }

    /// Convert a wire code to a `Unit`.
    #[inline]
    pub fn from_raw(raw: u8) -> Result<Self, Error> {
        match raw {
            1 => Ok(Unit::Char),
            2 => Ok(Unit::Bool),
            3 => Ok(Unit::Int8),
            4 => Ok(Unit::Int16),
            5 => Ok(Unit::Int32),
            6 => Ok(Unit::Int64),
            7 => Ok(Unit::Uint8),
            8 => Ok(Unit::Uint16),
            9 => Ok(Unit::Uint32),
            10 => Ok(Unit::Uint64),
            11 => Ok(Unit::Float),
            12 => Ok(Unit::Double),
            raw => Err(Error::new(ErrorKind::UnknownUnit(raw))),
        }
    }

    /// The width of one element in bytes.
    #[inline]
    pub fn size(self) -> usize {
        match self {
            Unit::Char | Unit::Bool | Unit::Int8 | Unit::Uint8 => 1,
            Unit::Int16 | Unit::Uint16 => 2,
            Unit::Int32 | Unit::Uint32 | Unit::Float => 4,
            Unit::Int64 | Unit::Uint64 | Unit::Double => 8,
        }
    }

    /// The display name of the unit.
    pub fn name(self) -> &'static str {
        match self {
            Unit::Char => "CHAR",
            Unit::Bool => "BOOL",
            Unit::Int8 => "INT_8",
            Unit::Int16 => "INT_16",
            Unit::Int32 => "INT_32",
            Unit::Int64 => "INT_64",
            Unit::Uint8 => "UINT_8",
            Unit::Uint16 => "UINT_16",
            Unit::Uint32 => "UINT_32",
            Unit::Uint64 => "UINT_64",
            Unit::Float => "FLOAT",
            Unit::Double => "DOUBLE",
        }
    }

    /// Parse the textual form of one element into its native byte
    /// representation.
    ///
    /// `out` must be exactly [`size`] bytes. Integer values which do not fit
    /// the element width are rejected rather than truncated.
    ///
    /// [`size`]: Unit::size
    ///
    /// # Examples
    ///
    /// ```
    /// use protocol::Unit;
    ///
    /// let mut out = [0u8; 2];
    /// Unit::Int16.parse("-2", &mut out)?;
    /// assert_eq!(out, i16::to_ne_bytes(-2));
    ///
    /// assert!(Unit::Int8.parse("200", &mut out[..1]).is_err());
    /// # Ok::<_, protocol::Error>(())
    /// ```
    pub fn parse(self, text: &str, out: &mut [u8]) -> Result<(), Error> {
        assert_eq!(out.len(), self.size(), "Output must be one element wide");

        let invalid = || Error::new(ErrorKind::InvalidValue { unit: self });

        match self {
            Unit::Char => {
                let &[byte] = text.as_bytes() else {
                    return Err(invalid());
                };

                out[0] = byte;
            }
            Unit::Bool => {
                let value = text.parse::<i64>().map_err(|_| invalid())?;
                out[0] = (value != 0) as u8;
            }
            Unit::Int8 => {
                out.copy_from_slice(&text.parse::<i8>().map_err(|_| invalid())?.to_ne_bytes());
            }
            Unit::Int16 => {
                out.copy_from_slice(&text.parse::<i16>().map_err(|_| invalid())?.to_ne_bytes());
            }
            Unit::Int32 => {
                out.copy_from_slice(&text.parse::<i32>().map_err(|_| invalid())?.to_ne_bytes());
            }
            Unit::Int64 => {
                out.copy_from_slice(&text.parse::<i64>().map_err(|_| invalid())?.to_ne_bytes());
            }
            Unit::Uint8 => {
                out.copy_from_slice(&text.parse::<u8>().map_err(|_| invalid())?.to_ne_bytes());
            }
            Unit::Uint16 => {
                out.copy_from_slice(&text.parse::<u16>().map_err(|_| invalid())?.to_ne_bytes());
            }
            Unit::Uint32 => {
                out.copy_from_slice(&text.parse::<u32>().map_err(|_| invalid())?.to_ne_bytes());
            }
            Unit::Uint64 => {
                out.copy_from_slice(&text.parse::<u64>().map_err(|_| invalid())?.to_ne_bytes());
            }
            Unit::Float => {
                out.copy_from_slice(&text.parse::<f32>().map_err(|_| invalid())?.to_ne_bytes());
            }
            Unit::Double => {
                out.copy_from_slice(&text.parse::<f64>().map_err(|_| invalid())?.to_ne_bytes());
            }
        }

        Ok(())
    }

    /// Format one element from its native byte representation.
    ///
    /// `bytes` must be exactly [`size`] bytes.
    ///
    /// [`size`]: Unit::size
    ///
    /// # Examples
    ///
    /// ```
    /// use protocol::Unit;
    ///
    /// let bytes = i16::to_ne_bytes(30000);
    /// assert_eq!(Unit::Int16.format(&bytes), "30000");
    /// ```
    pub fn format(self, bytes: &[u8]) -> String {
        assert_eq!(bytes.len(), self.size(), "Input must be one element wide");

        fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
            let mut out = [0u8; N];
            out.copy_from_slice(bytes);
            out
        }

        match self {
            Unit::Char => char::from(bytes[0]).to_string(),
            Unit::Bool => u8::min(bytes[0], 1).to_string(),
            Unit::Int8 => i8::from_ne_bytes(array(bytes)).to_string(),
            Unit::Int16 => i16::from_ne_bytes(array(bytes)).to_string(),
            Unit::Int32 => i32::from_ne_bytes(array(bytes)).to_string(),
            Unit::Int64 => i64::from_ne_bytes(array(bytes)).to_string(),
            Unit::Uint8 => bytes[0].to_string(),
            Unit::Uint16 => u16::from_ne_bytes(array(bytes)).to_string(),
            Unit::Uint32 => u32::from_ne_bytes(array(bytes)).to_string(),
            Unit::Uint64 => u64::from_ne_bytes(array(bytes)).to_string(),
            Unit::Float => f32::from_ne_bytes(array(bytes)).to_string(),
            Unit::Double => f64::from_ne_bytes(array(bytes)).to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Unit;
    use crate::Error;

    #[test]
    fn parse_format_round_trip() -> Result<(), Error> {
        let cases: &[(Unit, &str)] = &[
            (Unit::Bool, "1"),
            (Unit::Int8, "-128"),
            (Unit::Int16, "30000"),
            (Unit::Int32, "-2147483648"),
            (Unit::Int64, "9007199254740993"),
            (Unit::Uint8, "255"),
            (Unit::Uint64, "18446744073709551615"),
            (Unit::Double, "1.5"),
        ];

        for &(unit, text) in cases {
            let mut bytes = vec![0u8; unit.size()];
            unit.parse(text, &mut bytes)?;
            assert_eq!(unit.format(&bytes), text, "{}", unit.name());
        }

        Ok(())
    }

    #[test]
    fn integer_overflow_rejected() {
        let mut out = [0u8; 1];
        assert!(Unit::Int8.parse("200", &mut out).is_err());
        assert!(Unit::Uint8.parse("-1", &mut out).is_err());

        let mut out = [0u8; 2];
        assert!(Unit::Int16.parse("40000", &mut out).is_err());
    }

    #[test]
    fn bool_accepts_any_nonzero() -> Result<(), Error> {
        let mut out = [0u8; 1];

        Unit::Bool.parse("17", &mut out)?;
        assert_eq!(out[0], 1);

        Unit::Bool.parse("0", &mut out)?;
        assert_eq!(out[0], 0);
        Ok(())
    }

    #[test]
    fn float_exponent_form() -> Result<(), Error> {
        let mut out = [0u8; 4];
        Unit::Float.parse("1.25e2", &mut out)?;
        assert_eq!(f32::from_ne_bytes(out), 125.0);
        Ok(())
    }
}
