use std::io;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

/// Upper bound on any length prefix read from the wire.
pub const MAX_SEQUENCE_LEN: usize = u16::MAX as usize;

/// Network byte order (big endian) encoding shared by everything that crosses the wire.
pub trait Bytes: Sized {
    fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error>;
    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error>;
}

macro_rules! impl_bytes_for_int {
    ($($ty:ty => $write:ident, $read:ident;)*) => {
        $(
            impl Bytes for $ty {
                fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
                    writer.$write::<BigEndian>(*self)
                }
                fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
                    reader.$read::<BigEndian>()
                }
            }
        )*
    };
}

impl_bytes_for_int! {
    u16 => write_u16, read_u16;
    u32 => write_u32, read_u32;
    u64 => write_u64, read_u64;
    i16 => write_i16, read_i16;
    i32 => write_i32, read_i32;
    i64 => write_i64, read_i64;
    f32 => write_f32, read_f32;
    f64 => write_f64, read_f64;
}

impl Bytes for u8 {
    fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        writer.write_u8(*self)
    }
    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        reader.read_u8()
    }
}

impl Bytes for i8 {
    fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        writer.write_i8(*self)
    }
    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        reader.read_i8()
    }
}

impl Bytes for bool {
    fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        writer.write_u8(u8::from(*self))
    }
    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        match reader.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid bool byte {other}"),
            )),
        }
    }
}

fn write_len(writer: &mut impl WriteBytesExt, len: usize) -> Result<(), io::Error> {
    if len > MAX_SEQUENCE_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("sequence length {len} exceeds {MAX_SEQUENCE_LEN}"),
        ));
    }
    writer.write_u16::<BigEndian>(len as u16)
}

impl Bytes for String {
    fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        write_len(writer, self.len())?;
        writer.write_all(self.as_bytes())
    }
    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        let len = reader.read_u16::<BigEndian>()? as usize;
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<T: Bytes> Bytes for Vec<T> {
    fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        write_len(writer, self.len())?;
        for item in self {
            item.write_to(writer)?;
        }
        Ok(())
    }
    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        let len = reader.read_u16::<BigEndian>()? as usize;
        // the prefix is untrusted, so never pre-allocate more than a small chunk
        let mut items = Vec::with_capacity(len.min(256));
        for _ in 0..len {
            items.push(T::read_from(reader)?);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_big_endian() {
        let mut buf = Vec::new();
        0x1234u16.write_to(&mut buf).unwrap();
        0xAABBCCDDu32.write_to(&mut buf).unwrap();
        assert_eq!(buf, [0x12, 0x34, 0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn invalid_bool_is_rejected() {
        let mut cursor = io::Cursor::new(&[2u8][..]);
        assert!(bool::read_from(&mut cursor).is_err());
    }

    #[test]
    fn truncated_string_is_rejected() {
        let mut buf = Vec::new();
        "hello".to_string().write_to(&mut buf).unwrap();
        buf.truncate(4);
        let mut cursor = io::Cursor::new(&buf[..]);
        assert!(String::read_from(&mut cursor).is_err());
    }
}
