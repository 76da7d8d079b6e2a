use std::collections::BTreeMap;

use symexpr::SymValue;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No data defined at the given address. `valid_bytes` counts the
    /// defined prefix of the requested range.
    #[error("no data defined at {address:#x} + {valid_bytes}")]
    UndefinedData { address: u64, valid_bytes: usize },

    /// A concrete read found symbolic data.
    #[error("symbolic data at {address:#x}")]
    SymbolicData { address: u64 },

    /// The arguments provided for a given request are invalid.
    #[error("arguments provided are not valid: {0}")]
    InvalidArguments(String),
}

/// Byte-granular sparse guest memory. Each defined byte is either a concrete
/// constant or a byte extracted from a wider symbolic value; reads reassemble
/// runs of extracts back into the original value.
#[derive(Debug, Clone, Default)]
pub struct Memory {
    bytes: BTreeMap<u64, SymValue>,
}

impl Memory {
    /// Read `size` bytes as a value. Fails with [Error::UndefinedData] if any
    /// byte in the range is undefined.
    pub fn read(&self, address: u64, size: usize) -> Result<SymValue> {
        if size == 0 || size > 8 {
            return Err(Error::InvalidArguments(format!(
                "read size {size} out of range"
            )));
        }

        let mut bytes = Vec::with_capacity(size);
        for i in 0..size {
            let offset = address
                .checked_add(i as u64)
                .ok_or_else(|| Error::InvalidArguments("address overflow".to_string()))?;
            match self.bytes.get(&offset) {
                Some(byte) => bytes.push(byte.clone()),
                None => {
                    return Err(Error::UndefinedData {
                        address,
                        valid_bytes: i,
                    })
                }
            }
        }

        Ok(SymValue::from_le_bytes(bytes))
    }

    /// Read `size` bytes that must all be concrete.
    pub fn read_concrete(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(size);
        for i in 0..size {
            let offset = address + i as u64;
            let byte = self
                .bytes
                .get(&offset)
                .ok_or(Error::UndefinedData {
                    address,
                    valid_bytes: i,
                })?;
            let value = byte
                .as_concrete()
                .ok_or(Error::SymbolicData { address: offset })?;
            bytes.push(value as u8);
        }

        Ok(bytes)
    }

    /// Write a value, spreading it over its byte span.
    pub fn write(&mut self, address: u64, value: SymValue) -> Result<()> {
        let size = value.size();
        address
            .checked_add(size as u64)
            .ok_or_else(|| Error::InvalidArguments("address overflow".to_string()))?;

        for i in 0..size {
            self.bytes.insert(address + i as u64, value.byte(i));
        }

        Ok(())
    }

    /// Write concrete bytes.
    pub fn write_bytes(&mut self, address: u64, data: &[u8]) -> Result<()> {
        for (i, &byte) in data.iter().enumerate() {
            self.bytes
                .insert(address + i as u64, SymValue::concrete(byte.into(), 8));
        }

        Ok(())
    }

    /// Whether the full range `[address, address + size)` is defined.
    pub fn is_defined(&self, address: u64, size: usize) -> bool {
        (0..size).all(|i| self.bytes.contains_key(&(address + i as u64)))
    }
}
