//! Dump WAL command implementation.

use boxdb_core::wal::{WalManager, WalRecord};
use boxdb_core::StoreDir;
use serde::Serialize;
use std::path::Path;

/// WAL record representation for output.
#[derive(Debug, Serialize, PartialEq)]
pub struct WalRecordInfo {
    /// Offset in the WAL file.
    pub offset: u64,
    /// Record type.
    pub record_type: &'static str,
    /// Transaction ID (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txid: Option<u64>,
    /// Table of the written record (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Object ID or first relation endpoint (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// Second relation endpoint (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary: Option<u64>,
    /// Sequence number (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// Payload size in bytes (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<usize>,
}

impl WalRecordInfo {
    fn new(offset: u64, record: &WalRecord) -> Self {
        let mut info = Self {
            offset,
            record_type: "",
            txid: record.txid().map(|t| t.as_u64()),
            table: None,
            id: None,
            secondary: None,
            sequence: None,
            payload_size: None,
        };
        match record {
            WalRecord::Begin { .. } => info.record_type = "BEGIN",
            WalRecord::Put { key, payload, .. } => {
                info.record_type = "PUT";
                info.table = Some(key.table.to_string());
                info.id = Some(key.primary);
                info.secondary = (key.secondary != 0).then_some(key.secondary);
                info.payload_size = Some(payload.len());
            }
            WalRecord::Delete { key, .. } => {
                info.record_type = "DELETE";
                info.table = Some(key.table.to_string());
                info.id = Some(key.primary);
                info.secondary = (key.secondary != 0).then_some(key.secondary);
            }
            WalRecord::Commit { sequence, .. } => {
                info.record_type = "COMMIT";
                info.sequence = Some(sequence.as_u64());
            }
            WalRecord::Checkpoint { sequence } => {
                info.record_type = "CHECKPOINT";
                info.sequence = Some(sequence.as_u64());
            }
        }
        info
    }
}

/// Runs the dump-wal command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    start_offset: u64,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let dir = StoreDir::open(path, true, 0o644)?;
    let wal = WalManager::new(dir.wal_backend()?, false);
    let records = read_wal_records(&wal, start_offset, limit)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&records)?),
        _ => print_text_output(&records),
    }
    Ok(())
}

/// Reads up to `limit` records at or after `start_offset`.
pub fn read_wal_records(
    wal: &WalManager,
    start_offset: u64,
    limit: Option<usize>,
) -> Result<Vec<WalRecordInfo>, Box<dyn std::error::Error>> {
    let mut records = Vec::new();
    for item in wal.iter()? {
        let (offset, record) = item?;
        if offset < start_offset {
            continue;
        }
        if records.len() >= limit.unwrap_or(usize::MAX) {
            break;
        }
        records.push(WalRecordInfo::new(offset, &record));
    }
    Ok(records)
}

fn print_text_output(records: &[WalRecordInfo]) {
    println!("WAL Records ({} total)", records.len());
    println!("================");
    println!();

    for record in records {
        print!("[{:08}] {:10}", record.offset, record.record_type);
        if let Some(txid) = record.txid {
            print!(" txid={txid}");
        }
        if let Some(seq) = record.sequence {
            print!(" seq={seq}");
        }
        if let Some(table) = &record.table {
            print!(" table={table}");
        }
        if let Some(id) = record.id {
            print!(" id={id}");
        }
        if let Some(secondary) = record.secondary {
            print!(" to={secondary}");
        }
        if let Some(size) = record.payload_size {
            print!(" payload={size} bytes");
        }
        println!();
    }
}
