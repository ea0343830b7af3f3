//! Property tests for the invariants named in the design documents: bare-map
//! load factor, rehash key-set preservation, and codec round-trip identity.

use quickcheck_macros::quickcheck;

use hpmap::codec::{BincodeCodec, Codec};
use hpmap::reducer::Keep;
use hpmap::BareMap;

fn weak_hash(k: u64) -> u64 {
    // Intentionally narrow range so chains actually form under test.
    k % 251
}

#[quickcheck]
fn bare_map_never_exceeds_its_load_factor(keys: Vec<u64>) -> bool {
    let mut m: BareMap<u64, ()> = BareMap::new();
    for k in keys {
        m.set(k, weak_hash(k), (), &Keep).unwrap();
        if m.n_keys() as f64 > m.n_buckets() as f64 * m.max_load_factor() {
            return false;
        }
    }
    true
}

#[quickcheck]
fn bare_map_rehash_preserves_the_key_set(keys: Vec<u64>) -> bool {
    let mut unique: Vec<u64> = keys.clone();
    unique.sort_unstable();
    unique.dedup();

    let mut m: BareMap<u64, u64> = BareMap::new();
    for &k in &unique {
        m.set(k, weak_hash(k), k * 2, &Keep).unwrap();
    }
    if m.n_keys() != unique.len() {
        return false;
    }
    unique.iter().all(|&k| m.get(&k, weak_hash(k)) == Some(&(k * 2)))
}

#[quickcheck]
fn bincode_codec_round_trips_u64(value: u64) -> bool {
    let codec = BincodeCodec;
    let mut buf = Vec::new();
    codec.encode(&value, &mut buf);
    let back: u64 = codec.decode(&buf).unwrap();
    back == value
}

#[quickcheck]
fn bincode_codec_round_trips_strings(value: String) -> bool {
    let codec = BincodeCodec;
    let mut buf = Vec::new();
    codec.encode(&value, &mut buf);
    let back: String = codec.decode(&buf).unwrap();
    back == value
}
