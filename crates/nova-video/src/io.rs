use std::io::{Read, Write};

use crate::error::{CacheError, Result};

pub trait WriteLeExt: Write {
    fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write_all(&[v])?;
        Ok(())
    }

    fn write_u32_le(&mut self, v: u32) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_u64_le(&mut self, v: u64) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_all(bytes)?;
        Ok(())
    }

    /// Writes an element count as a `u64`; the caller writes the elements.
    fn write_len_u64(&mut self, len: usize) -> Result<()> {
        let len: u64 = len
            .try_into()
            .map_err(|_| CacheError::Corrupt("length does not fit in u64"))?;
        self.write_u64_le(len)
    }
}

impl<T: Write + ?Sized> WriteLeExt for T {}

pub trait ReadLeExt: Read {
    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u32_le(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64_le(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads an element count written by [`WriteLeExt::write_len_u64`], rejecting counts above
    /// `max`.
    fn read_len_u64(&mut self, max: usize) -> Result<usize> {
        let len = self.read_u64_le()?;
        match usize::try_from(len) {
            Ok(len) if len <= max => Ok(len),
            _ => Err(CacheError::Corrupt("element count out of range")),
        }
    }

    fn read_exact_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| CacheError::OutOfMemory { len })?;
        buf.resize(len, 0);
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl<T: Read + ?Sized> ReadLeExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn read_exact_vec_allocation_failure_returns_error() {
        let mut cursor = Cursor::new(Vec::new());
        let err = cursor.read_exact_vec(usize::MAX).unwrap_err();
        assert!(matches!(err, CacheError::OutOfMemory { .. }));
    }

    #[test]
    fn oversized_counts_are_corrupt() {
        let mut bytes = Vec::new();
        bytes.write_len_u64(17).unwrap();
        let err = Cursor::new(bytes).read_len_u64(16).unwrap_err();
        assert!(matches!(err, CacheError::Corrupt(_)));
    }

    #[test]
    fn truncated_reads_are_io_errors() {
        let err = Cursor::new(vec![1u8, 2]).read_u32_le().unwrap_err();
        assert!(matches!(err, CacheError::Io(_)));
    }
}
