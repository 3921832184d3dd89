//! Wasm vat fixtures shared by the worker integration tests.

#![allow(dead_code)]

use anyhow::Result;
use serde_json::json;
use swing_protocol::{
    CapData, Kref, Message, ProtocolError, SetBundle, VatDeliveryObject, VatId, VatSyscallObject,
    VatSyscallResult, WorkerOptions,
};
use swing_store::Bundle;
use swing_worker::SyscallHandler;

fn escape(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("\\{:02x}", b)).collect()
}

/// Vat that logs, sends `syscall` verbatim and reports success.
pub fn vat_wasm(syscall: &[u8]) -> Result<Vec<u8>> {
    let result = serde_json::to_vec(&json!(["ok", null, null]))?;
    let log = b"delivered";
    let wat = format!(
        r#"(module
  (import "env" "syscall" (func $syscall (param i32 i32) (result i64)))
  (import "env" "test_log" (func $log (param i32 i32)))
  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 4096))
  (data (i32.const 0) "{syscall}")
  (data (i32.const 1024) "{result}")
  (data (i32.const 2048) "{log}")
  (func (export "alloc") (param i32) (result i32)
    (local $old i32)
    global.get $heap
    local.tee $old
    local.get 0
    i32.add
    global.set $heap
    local.get $old)
  (func (export "deliver") (param i32 i32) (result i32 i32)
    (call $log (i32.const 2048) (i32.const {log_len}))
    (drop (call $syscall (i32.const 0) (i32.const {syscall_len})))
    (i32.const 1024)
    (i32.const {result_len}))
)"#,
        syscall = escape(syscall),
        syscall_len = syscall.len(),
        result = escape(&result),
        result_len = result.len(),
        log = escape(log),
        log_len = log.len(),
    );
    Ok(wat::parse_str(&wat)?)
}

pub fn set_bundle(bundle: Bundle, consensus_mode: bool) -> SetBundle {
    SetBundle {
        vat_id: VatId::from_index(9),
        bundle: bundle.to_json(),
        vat_parameters: CapData::new("#null", vec![]),
        options: WorkerOptions {
            consensus_mode,
            vat_name: Some("wasm-vat".into()),
            metered: true,
        },
    }
}

pub fn ping() -> VatDeliveryObject {
    VatDeliveryObject::Message {
        target: Kref::parse("o+0").unwrap(),
        msg: Message::call("ping", vec![], None).unwrap(),
    }
}

/// Records syscalls and answers each with `null`.
#[derive(Default)]
pub struct Recorder {
    pub seen: Vec<VatSyscallObject>,
    pub rejected: Vec<String>,
}

impl SyscallHandler for Recorder {
    fn handle(&mut self, vso: VatSyscallObject) -> VatSyscallResult {
        self.seen.push(vso);
        VatSyscallResult::ok_null()
    }

    fn reject(&mut self, error: &ProtocolError) {
        self.rejected.push(error.to_string());
    }
}
