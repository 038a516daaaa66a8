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

//! The same tagged bytes classified by a script guest and a wasm guest.

use modbridge_core::{
    MemorySink, Module, ModuleFormat, ModuleInstance, ModuleLoader, ModuleManifest, PtrKind,
    RuntimeConfig,
};
use serde_json::{json, Value};
use std::sync::Arc;

/// An array holding one value of every kind, in tag order. Every byte is
/// below 0x80, so a script can stage it as text unchanged.
fn every_kind() -> Vec<u8> {
    let mut bytes = vec![PtrKind::Array.tag()];
    bytes.extend_from_slice(&7u32.to_le_bytes());
    bytes.push(PtrKind::Null.tag());
    bytes.extend_from_slice(&[PtrKind::Bool.tag(), 1]);
    bytes.push(PtrKind::Number.tag());
    bytes.extend_from_slice(&0f64.to_le_bytes());
    bytes.push(PtrKind::String.tag());
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.push(b'x');
    bytes.push(PtrKind::Array.tag());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.push(PtrKind::Object.tag());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.push(PtrKind::Function.tag());
    bytes.extend_from_slice(&7u32.to_le_bytes());
    bytes
}

const SCRIPT: &str = r#"
function search(bytes) {
    const [offset, length] = modbridge.stageText(String.fromCharCode(...bytes));
    const root = modbridge.parseBuffer(offset, length);
    const kinds = [];
    for (let i = 0; i < modbridge.lengthOf(root); i++) {
        kinds.push(modbridge.kindOf(modbridge.at(root, i)));
    }
    return kinds;
}
"#;

/// Parses the bytes at 16, then writes the kinds as a tagged array of
/// numbers at 512 and hands that back.
fn wat(bytes: &[u8]) -> String {
    let data: String = bytes.iter().map(|b| format!("\\{:02x}", b)).collect();
    let len = bytes.len();
    format!(
        r#"
(module
  (import "modbridge" "parseBuffer" (func $parse (param i32 i32) (result i64)))
  (import "modbridge" "at" (func $at (param i64 i32) (result i64)))
  (import "modbridge" "kindOf" (func $kind (param i64) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "{data}")
  (func (export "modbridge_alloc") (param i32) (result i32)
    i32.const 1024)
  (func (export "search") (param i32 i32) (result i64)
    (local $root i64) (local $i i32) (local $out i32)
    i32.const 16
    i32.const {len}
    call $parse
    local.set $root
    i32.const 512
    i32.const 4
    i32.store8
    i32.const 513
    i32.const 7
    i32.store
    block $done
      loop $next
        local.get $i
        i32.const 7
        i32.ge_u
        br_if $done
        local.get $i
        i32.const 9
        i32.mul
        i32.const 517
        i32.add
        local.tee $out
        i32.const 2
        i32.store8
        local.get $out
        i32.const 1
        i32.add
        local.get $root
        local.get $i
        call $at
        call $kind
        f64.convert_i32_u
        f64.store
        local.get $i
        i32.const 1
        i32.add
        local.set $i
        br $next
      end
    end
    i32.const 512
    i32.const 68
    call $parse))
"#
    )
}

fn load(entry_file: &str, bytes: Vec<u8>) -> ModuleInstance {
    let manifest = ModuleManifest {
        id: "kinds".into(),
        name: "Kinds".into(),
        version: "1.0.0".into(),
        entry_file: entry_file.into(),
        capabilities: vec![],
        description: None,
        icon: None,
        authors: vec![],
    };
    ModuleLoader::new(RuntimeConfig::default())
        .unwrap()
        .with_sink(Arc::new(MemorySink::new()))
        .without_network()
        .load(Module::new(manifest, bytes).unwrap())
        .unwrap()
}

#[tokio::test]
async fn test_kind_of_agrees_across_adapters() {
    let bytes = every_kind();
    assert!(bytes.iter().all(|b| *b < 0x80));

    let script = load("index.js", SCRIPT.as_bytes().to_vec());
    let wasm = load("module.wasm", wat(&bytes).into_bytes());
    assert_eq!(script.format(), ModuleFormat::Script);
    assert_eq!(wasm.format(), ModuleFormat::Wasm);

    let expected: Vec<u8> = [
        PtrKind::Null,
        PtrKind::Bool,
        PtrKind::Number,
        PtrKind::String,
        PtrKind::Array,
        PtrKind::Object,
        PtrKind::Function,
    ]
    .iter()
    .map(|kind| kind.tag())
    .collect();

    let from_script = script.call("search", vec![json!(bytes)], None).await.unwrap();
    let from_wasm = wasm.call("search", vec![], None).await.unwrap();
    assert_eq!(from_script, json!(expected));
    assert_eq!(from_wasm, from_script);
    assert!(matches!(from_wasm, Value::Array(ref kinds) if kinds.len() == 7));
}
