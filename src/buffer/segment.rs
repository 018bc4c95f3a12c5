use crate::constants::defaults::SEGMENT_ALIGNMENT;
use crate::protocol::ProtocolError;

/// The slice of the address space owned by one server rank
///
/// Only the owning rank's buffer touches it; every other rank goes through
/// the wire protocol.
#[derive(Debug)]
pub(crate) struct Segment {
    data: Vec<u8>,
}

impl Segment {
    pub(crate) fn new(length: u64) -> Self {
        let reserve = length.div_ceil(SEGMENT_ALIGNMENT) * SEGMENT_ALIGNMENT;
        let mut data = Vec::with_capacity(reserve as usize);
        data.resize(length as usize, 0);
        Self { data }
    }

    pub(crate) fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn check(&self, offset: u64, length: usize) -> Result<std::ops::Range<usize>, ProtocolError> {
        let end = offset.checked_add(length as u64);
        match end {
            Some(end) if end <= self.len() => Ok(offset as usize..end as usize),
            _ => Err(ProtocolError::OutOfRange {
                address: offset as i64,
                length: length as i64,
                segment: self.len(),
            }),
        }
    }

    pub(crate) fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<(), ProtocolError> {
        let range = self.check(offset, bytes.len())?;
        self.data[range].copy_from_slice(bytes);
        Ok(())
    }

    pub(crate) fn read(&self, offset: u64, length: usize) -> Result<&[u8], ProtocolError> {
        let range = self.check(offset, length)?;
        Ok(&self.data[range])
    }
}
