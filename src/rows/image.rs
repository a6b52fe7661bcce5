use super::errors::{RowError, RowResult};
use crate::codec::{OverflowAddress, Payload, OVERFLOW_ADDRESS_LEN};

const TAG_INLINE: u8 = 0;
const TAG_EXTENDED: u8 = 1;

/// What the engine stores for a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowImage {
    Inline(Vec<u8>),
    Extended(OverflowAddress),
}

impl RowImage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            RowImage::Inline(bytes) => {
                let mut out = Vec::with_capacity(1 + bytes.len());
                out.push(TAG_INLINE);
                out.extend_from_slice(bytes);
                out
            }
            RowImage::Extended(addr) => {
                let mut out = Vec::with_capacity(1 + OVERFLOW_ADDRESS_LEN);
                out.push(TAG_EXTENDED);
                addr.encode_into(&mut out);
                out
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> RowResult<Self> {
        match bytes.split_first() {
            Some((&TAG_INLINE, rest)) => Ok(RowImage::Inline(rest.to_vec())),
            Some((&TAG_EXTENDED, rest)) if rest.len() == OVERFLOW_ADDRESS_LEN => {
                OverflowAddress::decode(rest)
                    .map(RowImage::Extended)
                    .map_err(|_| RowError::BadImage("truncated overflow address"))
            }
            Some((&TAG_EXTENDED, _)) => Err(RowError::BadImage("overflow address of wrong length")),
            Some(_) => Err(RowError::BadImage("unknown row image tag")),
            None => Err(RowError::BadImage("empty row image")),
        }
    }

    pub fn extended(&self) -> Option<OverflowAddress> {
        match self {
            RowImage::Extended(addr) => Some(*addr),
            RowImage::Inline(_) => None,
        }
    }
}

impl From<Payload> for RowImage {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Inline(bytes) => RowImage::Inline(bytes),
            Payload::Extended(addr) => RowImage::Extended(addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_images_decode_as_encoded() {
        for image in [
            RowImage::Inline(b"hello".to_vec()),
            RowImage::Inline(Vec::new()),
            RowImage::Extended(OverflowAddress::new(2, 64, 5000)),
        ] {
            assert_eq!(RowImage::decode(&image.encode()).unwrap(), image);
        }
    }

    #[test]
    fn test_bad_images_are_rejected() {
        assert!(RowImage::decode(&[]).is_err());
        assert!(RowImage::decode(&[7, 1, 2]).is_err());
        assert!(RowImage::decode(&[TAG_EXTENDED, 1, 2, 3]).is_err());
    }
}
