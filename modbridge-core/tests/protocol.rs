// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Wire format and arena properties over arbitrary JSON trees.

use modbridge_core::codec::{decode_into, encode_json, materialize, MAX_DEPTH};
use modbridge_core::view;
use modbridge_core::{CoreError, HostObjectArena, PtrKind};
use proptest::prelude::*;
use serde_json::{json, Map, Value};

fn json_number() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i32>().prop_map(|n| json!(n)),
        any::<i32>().prop_map(|n| json!(n as f64 + 0.5)),
    ]
}

fn json_tree() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        json_number(),
        ".{0,12}".prop_map(Value::String),
    ];
    leaf.prop_recursive(6, 64, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::vec(("[a-z]{1,6}", inner), 0..6).prop_map(|entries| {
                let mut map = Map::new();
                for (key, value) in entries {
                    map.insert(key, value);
                }
                Value::Object(map)
            }),
        ]
    })
}

proptest! {
    #[test]
    fn prop_roundtrip_preserves_tree(value in json_tree()) {
        let mut arena = HostObjectArena::new();
        let handle = decode_into(&mut arena, &encode_json(&value)).unwrap();
        prop_assert_eq!(materialize(&arena, handle).unwrap(), value);
    }

    #[test]
    fn prop_integral_floats_read_back_as_integers(n in -(1i64 << 53) + 1..(1i64 << 53)) {
        let mut arena = HostObjectArena::new();
        let handle = decode_into(&mut arena, &encode_json(&json!(n as f64))).unwrap();
        prop_assert_eq!(materialize(&arena, handle).unwrap(), json!(n));
    }

    #[test]
    fn prop_truncated_input_is_rejected(value in json_tree(), cut in 1usize..16) {
        let bytes = encode_json(&value);
        let keep = bytes.len().saturating_sub(cut);
        let mut arena = HostObjectArena::new();
        prop_assert!(decode_into(&mut arena, &bytes[..keep]).is_err());
    }
}

#[test]
fn test_handles_go_stale_when_scope_ends() {
    let mut arena = HostObjectArena::new();
    let scope = arena.begin_scope();
    let root = decode_into(&mut arena, &encode_json(&json!({"title": "Batman"}))).unwrap();
    let title = view::get(&arena, root, "title").unwrap();
    assert_eq!(view::to_str(&arena, title).unwrap(), "Batman");

    arena.end_scope(scope).unwrap();
    assert!(matches!(view::kind_of(&arena, root), Err(CoreError::StaleHandle(_))));
    assert!(matches!(view::to_str(&arena, title), Err(CoreError::StaleHandle(_))));

    // A reused slot must not answer for the old handle.
    let scope = arena.begin_scope();
    let other = decode_into(&mut arena, &encode_json(&json!("Robin"))).unwrap();
    assert_eq!(other.index, root.index);
    assert!(matches!(arena.resolve(root), Err(CoreError::StaleHandle(_))));
    arena.end_scope(scope).unwrap();
}

#[test]
fn test_optional_chaining_yields_null() {
    let mut arena = HostObjectArena::new();
    let root = decode_into(&mut arena, &encode_json(&json!({"a": [1]}))).unwrap();

    let missing = view::get(&arena, root, "b").unwrap();
    assert!(missing.is_null());
    assert_eq!(view::kind_of(&arena, missing).unwrap(), PtrKind::Null);

    let through_null = view::get(&arena, missing, "c").unwrap();
    assert!(through_null.is_null());

    let list = view::get(&arena, root, "a").unwrap();
    assert!(view::at(&arena, list, 5).unwrap().is_null());
    assert!(view::at(&arena, list, -1).unwrap().is_null());
    assert_eq!(view::to_number(&arena, view::at(&arena, list, 0).unwrap()).unwrap(), 1.0);
}

#[test]
fn test_negative_zero_reads_back_as_zero() {
    let mut arena = HostObjectArena::new();
    let handle = decode_into(&mut arena, &encode_json(&json!(-0.0))).unwrap();
    assert_eq!(materialize(&arena, handle).unwrap(), json!(0));

    let handle = decode_into(&mut arena, &encode_json(&json!(2.5))).unwrap();
    assert_eq!(materialize(&arena, handle).unwrap(), json!(2.5));
}

#[test]
fn test_depth_limit() {
    let mut bytes = Vec::new();
    for _ in 0..=MAX_DEPTH {
        bytes.push(PtrKind::Array.tag());
        bytes.extend_from_slice(&1u32.to_le_bytes());
    }
    bytes.push(PtrKind::Null.tag());

    let mut arena = HostObjectArena::new();
    assert!(matches!(decode_into(&mut arena, &bytes), Err(CoreError::Decode(_))));
}

#[test]
fn test_malformed_input_classes() {
    let mut arena = HostObjectArena::new();
    assert!(matches!(decode_into(&mut arena, &[9]), Err(CoreError::Decode(_))));
    assert!(matches!(
        decode_into(&mut arena, &[PtrKind::Number.tag(), 0, 0]),
        Err(CoreError::OutOfBounds { .. })
    ));
    assert!(matches!(
        decode_into(&mut arena, &[PtrKind::String.tag(), 2, 0, 0, 0, 0xff, 0xfe]),
        Err(CoreError::Decode(_))
    ));
    assert!(matches!(
        decode_into(&mut arena, &[PtrKind::Null.tag(), PtrKind::Null.tag()]),
        Err(CoreError::Decode(_))
    ));
}
