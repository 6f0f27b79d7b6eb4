//! Minimal perfect hash over string keys.
//!
//! Built once on the server from the full key set and shipped to clients as
//! plain tables, so both sides map the same name to the same dense id. The
//! construction is the classic 3-partite hypergraph peeling: each key hashes
//! to one vertex in each of three disjoint ranges, peeled edges get 2-bit
//! labels whose sum mod 3 picks the defining vertex, and a rank table over
//! the label words turns vertex indices into dense ids.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Instant;

const LABEL_FREE: u64 = 0b11;
const PAIRS_PER_WORD: u32 = 32;
const MAX_SEED_ATTEMPTS: u32 = 64;
const MAX_HASH_GROWTH: u32 = 3;

/// The shareable part of a built hash: everything a peer needs to evaluate
/// `compute` for itself, with no knowledge of the original key set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MphfData {
    pub hash_len: u32,
    pub mask: u32,
    pub assignment: Vec<u64>,
    pub rank: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct StringMphf {
    pub seeds: [u32; 3],
    pub data: MphfData,
}

fn seed_u32() -> u32 {
    let mut hasher = DefaultHasher::new();
    Instant::now().hash(&mut hasher);
    hasher.finish() as u32
}

fn hash_key(seed: u32, key: &str) -> u32 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325 ^ (seed as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    for b in key.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (h ^ (h >> 32)) as u32
}

/// Non-free label pairs in the low `upto` pairs of a word.
fn count_assigned(word: u64, upto: u32) -> u32 {
    if upto == 0 {
        return 0;
    }
    // Force pairs at and above `upto` to the free pattern before counting.
    let masked = if upto >= PAIRS_PER_WORD {
        word
    } else {
        word | !((1u64 << (2 * upto)) - 1)
    };
    let free = (masked & (masked >> 1) & 0x5555_5555_5555_5555).count_ones();
    PAIRS_PER_WORD - free
}

fn get_label(assignment: &[u64], vertex: u32) -> u64 {
    let word = (vertex / PAIRS_PER_WORD) as usize;
    let shift = 2 * (vertex % PAIRS_PER_WORD);
    (assignment[word] >> shift) & 0b11
}

fn set_label(assignment: &mut [u64], vertex: u32, label: u64) {
    let word = (vertex / PAIRS_PER_WORD) as usize;
    let shift = 2 * (vertex % PAIRS_PER_WORD);
    assignment[word] &= !(0b11u64 << shift);
    assignment[word] |= label << shift;
}

impl StringMphf {
    /// Builds a minimal perfect hash for `keys` (which must be distinct).
    /// Returns `None` when every seed/size attempt fails, which for
    /// reasonable key sets does not happen in practice.
    pub fn build(keys: &[&str]) -> Option<StringMphf> {
        let n = keys.len() as u32;
        // ceil(log2(n)), floored at 1.
        let hash_len = 32 - (n.max(2) - 1).leading_zeros();

        for growth in 0..=MAX_HASH_GROWTH {
            for _ in 0..MAX_SEED_ATTEMPTS {
                let seeds = [seed_u32(), seed_u32(), seed_u32()];
                if let Some(mphf) = Self::try_build(keys, seeds, hash_len + growth) {
                    return Some(mphf);
                }
            }
            log::debug!(
                "mphf: exhausted seeds at hash_len {}, growing table",
                hash_len + growth
            );
        }
        log::warn!("mphf: failed to build over {} keys", n);
        None
    }

    /// Reassembles a hash from received parts; used when the tables come in
    /// over the wire instead of being built locally.
    pub fn from_parts(seeds: [u32; 3], data: MphfData) -> StringMphf {
        StringMphf { seeds, data }
    }

    fn try_build(keys: &[&str], seeds: [u32; 3], hash_len: u32) -> Option<StringMphf> {
        let mask = (1u32 << hash_len) - 1;
        let partition = mask + 1;
        let vertex_count = 3 * partition;

        let edges: Vec<[u32; 3]> = keys
            .iter()
            .map(|key| {
                let mut edge = [0u32; 3];
                for (i, seed) in seeds.iter().enumerate() {
                    edge[i] = (hash_key(*seed, key) & mask) + i as u32 * partition;
                }
                edge
            })
            .collect();

        let mut incidence: Vec<Vec<u32>> = vec![Vec::new(); vertex_count as usize];
        let mut degree = vec![0u32; vertex_count as usize];
        for (e, edge) in edges.iter().enumerate() {
            for &v in edge {
                incidence[v as usize].push(e as u32);
                degree[v as usize] += 1;
            }
        }

        // Peel: repeatedly detach edges hanging off degree-1 vertices.
        let mut removed = vec![false; edges.len()];
        let mut peel_order: Vec<(u32, u32)> = Vec::with_capacity(edges.len());
        let mut queue: Vec<u32> = (0..vertex_count).filter(|&v| degree[v as usize] == 1).collect();
        while let Some(v) = queue.pop() {
            if degree[v as usize] != 1 {
                continue;
            }
            let e = *incidence[v as usize]
                .iter()
                .find(|&&e| !removed[e as usize])?;
            removed[e as usize] = true;
            let edge = &edges[e as usize];
            let defining = edge.iter().position(|&u| u == v)? as u32;
            peel_order.push((e, defining));
            for &u in edge {
                degree[u as usize] -= 1;
                if degree[u as usize] == 1 {
                    queue.push(u);
                }
            }
        }
        if peel_order.len() != edges.len() {
            return None;
        }

        // Label in reverse peel order so each defining vertex settles the
        // edge's sum mod 3 to its own position. Only defining vertices are
        // ever labeled; the rest stay at the free pattern (0b11, which is
        // 0 mod 3), so the rank table counts exactly one vertex per key.
        let words = vertex_count.div_ceil(PAIRS_PER_WORD) as usize;
        let mut assignment = vec![u64::MAX; words];
        for &(e, defining) in peel_order.iter().rev() {
            let edge = &edges[e as usize];
            let mut sum = 0u64;
            for (i, &v) in edge.iter().enumerate() {
                if i as u32 != defining {
                    sum += get_label(&assignment, v);
                }
            }
            let label = (defining as u64 + 3 - sum % 3) % 3;
            set_label(&mut assignment, edge[defining as usize], label);
        }

        let mut rank = vec![0u32; words];
        let mut total = 0u32;
        for (i, word) in assignment.iter().enumerate() {
            rank[i] = total;
            total += count_assigned(*word, PAIRS_PER_WORD);
        }

        Some(StringMphf {
            seeds,
            data: MphfData {
                hash_len,
                mask,
                assignment,
                rank,
            },
        })
    }

    /// Bit width of ids produced by `compute`; struct keys are written at
    /// this width in the codec.
    pub fn hash_len(&self) -> u32 {
        self.data.hash_len
    }

    pub fn key_count(&self) -> u32 {
        let last = self.data.assignment.len().saturating_sub(1);
        match self.data.assignment.last() {
            Some(word) => self.data.rank[last] + count_assigned(*word, PAIRS_PER_WORD),
            None => 0,
        }
    }

    /// Dense id for `key`. For keys in the built set this is a bijection
    /// onto `0..n`; unknown keys land on an arbitrary in-range id.
    pub fn compute(&self, key: &str) -> u32 {
        let partition = self.data.mask + 1;
        let mut vertices = [0u32; 3];
        let mut label_sum = 0u64;
        for (i, seed) in self.seeds.iter().enumerate() {
            vertices[i] = (hash_key(*seed, key) & self.data.mask) + i as u32 * partition;
            label_sum += get_label(&self.data.assignment, vertices[i]);
        }
        let bucket = vertices[(label_sum % 3) as usize];
        let word = (bucket / PAIRS_PER_WORD) as usize;
        self.data.rank[word] + count_assigned(self.data.assignment[word], bucket % PAIRS_PER_WORD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn key_set(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("field_{i}")).collect()
    }

    #[test]
    fn bijective_over_large_set() {
        let owned = key_set(1000);
        let keys: Vec<&str> = owned.iter().map(String::as_str).collect();
        let mphf = StringMphf::build(&keys).unwrap();

        let ids: HashSet<u32> = keys.iter().map(|k| mphf.compute(k)).collect();
        assert_eq!(ids.len(), keys.len());
        assert!(ids.iter().all(|&id| (id as usize) < keys.len()));
        assert_eq!(mphf.key_count() as usize, keys.len());
    }

    #[test]
    fn ids_fit_the_key_count_and_hash_width() {
        let owned = key_set(100);
        let keys: Vec<&str> = owned.iter().map(String::as_str).collect();
        let mphf = StringMphf::build(&keys).unwrap();

        // Ids must be dense (< n) and representable at hash_len bits, since
        // the codec writes struct keys at exactly that width.
        let max_id = keys.iter().map(|k| mphf.compute(k)).max().unwrap();
        assert!(max_id < keys.len() as u32, "max id {} over {} keys", max_id, keys.len());
        assert!(max_id < (1u32 << mphf.hash_len()));
        assert_eq!(mphf.key_count() as usize, keys.len());
    }

    #[test]
    fn stable_across_reassembly() {
        let owned = key_set(37);
        let keys: Vec<&str> = owned.iter().map(String::as_str).collect();
        let built = StringMphf::build(&keys).unwrap();

        let remote = StringMphf::from_parts(built.seeds, built.data.clone());
        for key in &keys {
            assert_eq!(built.compute(key), remote.compute(key));
        }
    }

    #[test]
    fn tiny_sets_build() {
        for n in 1..=4 {
            let owned = key_set(n);
            let keys: Vec<&str> = owned.iter().map(String::as_str).collect();
            let mphf = StringMphf::build(&keys).unwrap();
            let ids: HashSet<u32> = keys.iter().map(|k| mphf.compute(k)).collect();
            assert_eq!(ids.len(), n);
        }
    }

    #[test]
    fn partial_word_counting() {
        // Word with pairs: [0]=0b00, [1]=0b11(free), [2]=0b10, rest free.
        let word = u64::MAX & !0b11 & !(0b11 << 4) | (0b10 << 4);
        assert_eq!(count_assigned(word, 0), 0);
        assert_eq!(count_assigned(word, 1), 1);
        assert_eq!(count_assigned(word, 2), 1);
        assert_eq!(count_assigned(word, 3), 2);
        assert_eq!(count_assigned(word, 32), 2);
    }
}
