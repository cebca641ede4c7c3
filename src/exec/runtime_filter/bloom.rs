// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Block bloom filter over 64-bit key hashes.
//!
//! Responsibilities:
//! - Splits the bit array into 256-bit buckets (8 x 32-bit words); one hash sets one
//!   bit per word of one bucket using salted multiplicative masks.
//! - Provides a plain variant for single-threaded builds and probing, and an atomic
//!   variant that many threads may insert into concurrently without a merge step.
//!
//! Key exported interfaces:
//! - Types: `BlockBloomFilter`, `AtomicBlockBloomFilter`.

use std::sync::atomic::{AtomicU32, Ordering};

const WORDS_PER_BUCKET: usize = 8;
const BITS_PER_BUCKET: u64 = 256;

const SALT: [u32; WORDS_PER_BUCKET] = [
    0x47b6137b, 0x44974d91, 0x8824ad5b, 0xa2b7289d, 0x705495c7, 0x2df1424b, 0x9efc4947, 0x5c6bfb31,
];

fn make_mask(key: u32) -> [u32; WORDS_PER_BUCKET] {
    let mut masks = [0u32; WORDS_PER_BUCKET];
    for (i, mask) in masks.iter_mut().enumerate() {
        let v = key.wrapping_mul(SALT[i]) >> 27;
        *mask = 1u32 << v;
    }
    masks
}

/// Bucket geometry derived from the expected key count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Geometry {
    log_num_buckets: u32,
    directory_mask: u32,
}

impl Geometry {
    fn for_keys(num_keys: usize, bits_per_key: usize) -> Self {
        let total_bits = (num_keys.max(1) as u64).saturating_mul(bits_per_key.max(1) as u64);
        let num_buckets = total_bits.div_ceil(BITS_PER_BUCKET).max(2);
        let log_num_buckets = num_buckets.next_power_of_two().trailing_zeros().min(31);
        Self {
            log_num_buckets,
            directory_mask: ((1u64 << log_num_buckets) - 1) as u32,
        }
    }

    fn words(&self) -> usize {
        (1usize << self.log_num_buckets) * WORDS_PER_BUCKET
    }

    fn locate(&self, hash: u64) -> (usize, [u32; WORDS_PER_BUCKET]) {
        let bucket_idx = (hash as u32) & self.directory_mask;
        let key = (hash >> self.log_num_buckets) as u32;
        (bucket_idx as usize * WORDS_PER_BUCKET, make_mask(key))
    }
}

#[derive(Clone, Debug)]
pub struct BlockBloomFilter {
    geometry: Geometry,
    directory: Vec<u32>,
}

/// Directory bytes a filter sized for `num_keys` keys will allocate.
pub fn directory_bytes(num_keys: usize, bits_per_key: usize) -> usize {
    Geometry::for_keys(num_keys, bits_per_key).words() * std::mem::size_of::<u32>()
}

impl BlockBloomFilter {
    pub fn with_capacity(num_keys: usize, bits_per_key: usize) -> Self {
        let geometry = Geometry::for_keys(num_keys, bits_per_key);
        Self {
            directory: vec![0u32; geometry.words()],
            geometry,
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        self.directory.len() * std::mem::size_of::<u32>()
    }

    pub fn insert_hash(&mut self, hash: u64) {
        let (base, masks) = self.geometry.locate(hash);
        for (word, mask) in self.directory[base..base + WORDS_PER_BUCKET]
            .iter_mut()
            .zip(masks)
        {
            *word |= mask;
        }
    }

    pub fn test_hash(&self, hash: u64) -> bool {
        let (base, masks) = self.geometry.locate(hash);
        self.directory[base..base + WORDS_PER_BUCKET]
            .iter()
            .zip(masks)
            .all(|(word, mask)| word & mask != 0)
    }
}

/// Bloom filter accepting concurrent inserts through shared atomic words.
#[derive(Debug)]
pub struct AtomicBlockBloomFilter {
    geometry: Geometry,
    directory: Vec<AtomicU32>,
}

impl AtomicBlockBloomFilter {
    pub fn with_capacity(num_keys: usize, bits_per_key: usize) -> Self {
        let geometry = Geometry::for_keys(num_keys, bits_per_key);
        let directory = (0..geometry.words()).map(|_| AtomicU32::new(0)).collect();
        Self {
            geometry,
            directory,
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        self.directory.len() * std::mem::size_of::<u32>()
    }

    pub fn insert_hash(&self, hash: u64) {
        let (base, masks) = self.geometry.locate(hash);
        for (word, mask) in self.directory[base..base + WORDS_PER_BUCKET]
            .iter()
            .zip(masks)
        {
            word.fetch_or(mask, Ordering::Relaxed);
        }
    }

    /// Snapshot into a plain filter. Callers must order this after all inserts.
    pub fn freeze(&self) -> BlockBloomFilter {
        BlockBloomFilter {
            geometry: self.geometry,
            directory: self
                .directory
                .iter()
                .map(|w| w.load(Ordering::Acquire))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AtomicBlockBloomFilter, BlockBloomFilter, Geometry, directory_bytes};
    use std::sync::Arc;

    fn mix(i: u64) -> u64 {
        i.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ (i >> 7)
    }

    #[test]
    fn geometry_scales_with_keys() {
        let small = Geometry::for_keys(10, 16);
        let large = Geometry::for_keys(1_000_000, 16);
        assert_eq!(small.log_num_buckets, 1);
        assert!(large.log_num_buckets > small.log_num_buckets);
        assert_eq!(large.words(), (1 << large.log_num_buckets) * 8);
        assert_eq!(
            directory_bytes(1_000_000, 16),
            BlockBloomFilter::with_capacity(1_000_000, 16).size_in_bytes()
        );
        assert_eq!(
            directory_bytes(10, 16),
            AtomicBlockBloomFilter::with_capacity(10, 16).size_in_bytes()
        );
    }

    #[test]
    fn inserted_hashes_always_test_positive() {
        let mut bf = BlockBloomFilter::with_capacity(1000, 16);
        for i in 0..1000u64 {
            bf.insert_hash(mix(i));
        }
        assert!((0..1000u64).all(|i| bf.test_hash(mix(i))));
        let false_positives = (1000..11000u64).filter(|i| bf.test_hash(mix(*i))).count();
        assert!(false_positives < 1000, "fp={}", false_positives);
    }

    #[test]
    fn concurrent_atomic_inserts_match_sequential_build() {
        let atomic = Arc::new(AtomicBlockBloomFilter::with_capacity(4000, 16));
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let atomic = Arc::clone(&atomic);
                std::thread::spawn(move || {
                    for i in (t * 1000)..((t + 1) * 1000) {
                        atomic.insert_hash(mix(i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let mut sequential = BlockBloomFilter::with_capacity(4000, 16);
        for i in 0..4000u64 {
            sequential.insert_hash(mix(i));
        }
        assert_eq!(atomic.freeze().directory, sequential.directory);
        assert_eq!(atomic.size_in_bytes(), sequential.size_in_bytes());
    }
}
