//! Stable content hashing
//!
//! Layout hashes are persisted alongside datasets, so they must not depend on
//! `std::hash` (whose output is allowed to change between releases).

const SEED: u64 = 0xff51_afd7_ed55_8ccd;

/// Values that can be fed to a [`HashCombiner`].
pub trait HashValue {
    fn hash_value(&self) -> u64;
}

fn mix(value: u64) -> u64 {
    value
        .wrapping_mul(0x87c3_7b91_1142_53d5)
        .rotate_left(31)
        .wrapping_mul(0x4cf5_ad43_2745_937f)
}

macro_rules! impl_hash_value_int {
    ($($t:ty),*) => {
        $(impl HashValue for $t {
            fn hash_value(&self) -> u64 {
                mix(*self as u64)
            }
        })*
    };
}

impl_hash_value_int!(u8, u16, u32, u64, usize, i32, i64);

impl HashValue for bool {
    fn hash_value(&self) -> u64 {
        mix(*self as u64)
    }
}

impl HashValue for f32 {
    fn hash_value(&self) -> u64 {
        mix(self.to_bits() as u64)
    }
}

impl HashValue for f64 {
    fn hash_value(&self) -> u64 {
        mix(self.to_bits())
    }
}

impl HashValue for str {
    fn hash_value(&self) -> u64 {
        let mut combiner = HashCombiner::new().add(&(self.len() as u64));
        for chunk in self.as_bytes().chunks(8) {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            combiner = combiner.add(&u64::from_le_bytes(word));
        }
        combiner.finish()
    }
}

impl HashValue for String {
    fn hash_value(&self) -> u64 {
        self.as_str().hash_value()
    }
}

impl<T: HashValue> HashValue for Option<T> {
    fn hash_value(&self) -> u64 {
        match self {
            Some(value) => HashCombiner::new().add(&1u8).add(value).finish(),
            None => mix(0),
        }
    }
}

/// Order dependent hash accumulator
#[derive(Debug, Clone, Copy)]
pub struct HashCombiner {
    hash: u64,
}

impl HashCombiner {
    pub fn new() -> Self {
        Self { hash: SEED }
    }

    /// Fold one value into the hash
    pub fn add<T: HashValue + ?Sized>(mut self, value: &T) -> Self {
        self.hash ^= value.hash_value();
        self.hash = self.hash.rotate_left(27);
        self.hash = self.hash.wrapping_mul(5).wrapping_add(0x52dc_e729);
        self
    }

    pub fn add_all<T: HashValue>(self, values: &[T]) -> Self {
        values.iter().fold(self, |combiner, v| combiner.add(v))
    }

    pub fn finish(self) -> u64 {
        self.hash
    }
}

impl Default for HashCombiner {
    fn default() -> Self {
        Self::new()
    }
}
