use md5::{Digest, Md5};
use num_bigint::{BigInt, Sign};
use std::num::Wrapping;

use super::{Token, TokenParseError};

/// Partitioner selected for a cluster (or overridden per table).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum PartitionerName {
    #[default]
    Murmur3,
    Random,
    ByteOrdered,
}

impl PartitionerName {
    pub fn from_str(name: &str) -> Option<Self> {
        if name.ends_with("Murmur3Partitioner") {
            Some(PartitionerName::Murmur3)
        } else if name.ends_with("RandomPartitioner") {
            Some(PartitionerName::Random)
        } else if name.ends_with("ByteOrderedPartitioner") {
            Some(PartitionerName::ByteOrdered)
        } else {
            None
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PartitionerName::Murmur3 => "Murmur3Partitioner",
            PartitionerName::Random => "RandomPartitioner",
            PartitionerName::ByteOrdered => "ByteOrderedPartitioner",
        }
    }

    /// Hashes a routing key onto this partitioner's token domain.
    pub fn hash(&self, pk: &[u8]) -> Token {
        match self {
            PartitionerName::Murmur3 => Murmur3Partitioner::hash(pk),
            PartitionerName::Random => {
                let mut hasher = Md5::new();
                hasher.update(pk);
                let digest = hasher.finalize();
                Token::Random(BigInt::from_bytes_be(Sign::Plus, &digest))
            }
            PartitionerName::ByteOrdered => Token::ByteOrdered(pk.to_vec()),
        }
    }

    /// Parses a token from its textual form in the system tables.
    pub fn parse_token(&self, s: &str) -> Result<Token, TokenParseError> {
        let err = || TokenParseError {
            token: s.to_string(),
            partitioner: self.name(),
        };
        match self {
            PartitionerName::Murmur3 => s
                .parse::<i64>()
                .map(Murmur3Partitioner::normalize)
                .map_err(|_| err()),
            PartitionerName::Random => s
                .parse::<BigInt>()
                .map(Token::Random)
                .map_err(|_| err()),
            // The byte-ordered partitioner publishes tokens as plain strings.
            PartitionerName::ByteOrdered => Ok(Token::ByteOrdered(s.as_bytes().to_vec())),
        }
    }
}

pub struct Murmur3Partitioner;

impl Murmur3Partitioner {
    // i64::MIN is not a valid token - it stands for infinity on the ring
    // and is normalized away.
    fn normalize(value: i64) -> Token {
        Token::Murmur3(if value == i64::MIN { i64::MAX } else { value })
    }

    pub fn hash(pk: &[u8]) -> Token {
        Self::normalize(Self::hash3_x64_128(pk) as i64)
    }

    // MurmurHash3 x64/128, with the historical signed-arithmetic quirk
    // that servers of this protocol family inherited: tail bytes are
    // sign-extended instead of zero-extended. Reproducing the quirk is
    // what keeps tokens compatible, so this must not be "fixed".
    fn hash3_x64_128(data: &[u8]) -> i128 {
        const C1: Wrapping<i64> = Wrapping(0x87c3_7b91_1142_53d5_u64 as i64);
        const C2: Wrapping<i64> = Wrapping(0x4cf5_ad43_2745_937f_u64 as i64);

        let mut h1 = Wrapping(0_i64);
        let mut h2 = Wrapping(0_i64);

        let mut blocks = data.chunks_exact(16);
        for block in blocks.by_ref() {
            let mut k1 = Wrapping(i64::from_le_bytes(
                block[..8].try_into().expect("block halves are 8 bytes"),
            ));
            let mut k2 = Wrapping(i64::from_le_bytes(
                block[8..].try_into().expect("block halves are 8 bytes"),
            ));

            k1 *= C1;
            k1 = Self::rotl64(k1, 31);
            k1 *= C2;
            h1 ^= k1;

            h1 = Self::rotl64(h1, 27);
            h1 += h2;
            h1 = h1 * Wrapping(5) + Wrapping(0x52dce729);

            k2 *= C2;
            k2 = Self::rotl64(k2, 33);
            k2 *= C1;
            h2 ^= k2;

            h2 = Self::rotl64(h2, 31);
            h2 += h1;
            h2 = h2 * Wrapping(5) + Wrapping(0x38495ab5);
        }

        let tail = blocks.remainder();
        if tail.len() > 8 {
            let mut k2 = Self::gather_sign_extended_le(&tail[8..]);
            k2 *= C2;
            k2 = Self::rotl64(k2, 33);
            k2 *= C1;
            h2 ^= k2;
        }
        if !tail.is_empty() {
            let mut k1 = Self::gather_sign_extended_le(&tail[..tail.len().min(8)]);
            k1 *= C1;
            k1 = Self::rotl64(k1, 31);
            k1 *= C2;
            h1 ^= k1;
        }

        h1 ^= Wrapping(data.len() as i64);
        h2 ^= Wrapping(data.len() as i64);

        h1 += h2;
        h2 += h1;

        h1 = Self::fmix(h1);
        h2 = Self::fmix(h2);

        h1 += h2;
        h2 += h1;

        ((h2.0 as i128) << 64) | h1.0 as i128
    }

    // Little-endian assembly of up to 8 tail bytes, each sign-extended
    // before being placed (the compatibility quirk mentioned above; xor
    // makes the byte order of assembly irrelevant).
    fn gather_sign_extended_le(bytes: &[u8]) -> Wrapping<i64> {
        let mut gathered = 0_i64;
        for (position, byte) in bytes.iter().enumerate() {
            gathered ^= ((*byte as i8) as i64) << (position * 8);
        }
        Wrapping(gathered)
    }

    #[inline]
    fn rotl64(v: Wrapping<i64>, n: u32) -> Wrapping<i64> {
        Wrapping((v.0 << n) | (v.0 as u64 >> (64 - n)) as i64)
    }

    #[inline]
    fn fmix(mut k: Wrapping<i64>) -> Wrapping<i64> {
        k ^= Wrapping((k.0 as u64 >> 33) as i64);
        k *= Wrapping(0xff51afd7ed558ccd_u64 as i64);
        k ^= Wrapping((k.0 as u64 >> 33) as i64);
        k *= Wrapping(0xc4ceb9fe1a85ec53_u64 as i64);
        k ^= Wrapping((k.0 as u64 >> 33) as i64);

        k
    }
}

#[cfg(test)]
mod tests {
    use super::{Murmur3Partitioner, PartitionerName, Token};
    use num_bigint::BigInt;

    // Reference tokens computed by a real cluster.
    #[test]
    fn murmur3_partitioner_matches_server_tokens() {
        for (routing_key, expected_token) in [
            ("test", -6017608668500074083_i64),
            ("primary_key", -1632642444691073360),
        ] {
            assert_eq!(
                Murmur3Partitioner::hash(routing_key.as_bytes()),
                Token::Murmur3(expected_token)
            );
        }
    }

    #[test]
    fn partitioner_name_lookup() {
        assert_eq!(
            PartitionerName::from_str("org.apache.cassandra.dht.Murmur3Partitioner"),
            Some(PartitionerName::Murmur3)
        );
        assert_eq!(
            PartitionerName::from_str("org.apache.cassandra.dht.RandomPartitioner"),
            Some(PartitionerName::Random)
        );
        assert_eq!(
            PartitionerName::from_str("org.apache.cassandra.dht.ByteOrderedPartitioner"),
            Some(PartitionerName::ByteOrdered)
        );
        assert_eq!(PartitionerName::from_str("SomethingElse"), None);
    }

    #[test]
    fn token_parsing_per_partitioner() {
        assert_eq!(
            PartitionerName::Murmur3.parse_token("-9187343239835811215"),
            Ok(Token::Murmur3(-9187343239835811215))
        );
        assert_eq!(
            PartitionerName::Random.parse_token("170141183460469231731687303715884105727"),
            Ok(Token::Random(
                "170141183460469231731687303715884105727"
                    .parse::<BigInt>()
                    .unwrap()
            ))
        );
        assert_eq!(
            PartitionerName::ByteOrdered.parse_token("key1"),
            Ok(Token::ByteOrdered(b"key1".to_vec()))
        );
        assert!(PartitionerName::Murmur3.parse_token("not a number").is_err());
    }

    #[test]
    fn murmur3_min_token_is_normalized() {
        // A textual i64::MIN token must never appear as-is on the ring.
        assert_eq!(
            PartitionerName::Murmur3.parse_token("-9223372036854775808"),
            Ok(Token::Murmur3(i64::MAX))
        );
    }

    #[test]
    fn random_partitioner_token_is_nonnegative() {
        for pk in [&b"test"[..], b"", b"\xff\xff\xff\xff"] {
            match PartitionerName::Random.hash(pk) {
                Token::Random(v) => assert!(v >= BigInt::from(0)),
                other => panic!("expected random token, got {:?}", other),
            }
        }
    }
}
