use bytecheck::CheckBytes;
use rkyv::{AlignedVec, Archive, Deserialize, Serialize};

use crate::{Address, ClusterError};

/// The name prefix of the sequential nodes registered by joining members.
pub(crate) const MEMBER_PREFIX: &str = "member_";
const SCRATCH_SPACE: usize = 256;

#[repr(C)]
#[derive(Serialize, Deserialize, Archive, Debug, Clone, PartialEq, Eq)]
#[archive_attr(derive(CheckBytes))]
/// The payload stored in a member node.
pub struct MemberRecord {
    pub host: String,
    pub port: u16,
    /// Opaque data handed to the decorator, for example transport settings.
    pub metadata: Vec<u8>,
}

impl MemberRecord {
    pub fn new(address: &Address, metadata: Vec<u8>) -> Self {
        Self {
            host: address.host().to_string(),
            port: address.port(),
            metadata,
        }
    }

    #[inline]
    pub fn address(&self) -> Address {
        Address::new(self.host.clone(), self.port)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ClusterError> {
        let bytes = rkyv::to_bytes::<_, SCRATCH_SPACE>(self)
            .map_err(|_| ClusterError::Encode(self.address().to_string()))?;
        Ok(bytes.to_vec())
    }

    pub fn decode(path: &str, buffer: &[u8]) -> Result<Self, ClusterError> {
        // Payloads read back from the registry carry no alignment guarantees.
        let mut aligned = AlignedVec::with_capacity(buffer.len());
        aligned.extend_from_slice(buffer);

        rkyv::from_bytes::<Self>(&aligned).map_err(|_| ClusterError::InvalidMember {
            path: path.to_string(),
            reason: "malformed member record".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_record_decode() {
        let record = MemberRecord::new(&Address::new("10.0.0.7", 8080), b"grpc".to_vec());
        let encoded = record.encode().expect("Encode record.");

        let decoded = MemberRecord::decode("/ns/c/0/member_0", &encoded).expect("Decode record.");
        assert_eq!(decoded.address(), Address::new("10.0.0.7", 8080));
        assert_eq!(decoded.metadata, b"grpc");

        let err = MemberRecord::decode("/ns/c/0/member_1", b"nope").expect_err("Reject garbage.");
        assert!(matches!(err, ClusterError::InvalidMember { .. }));
    }
}
