//! Verify command implementation.

use boxdb_codec::ObjectRecord;
use boxdb_core::segment::SegmentManager;
use boxdb_core::wal::{WalManager, WalRecord};
use boxdb_core::{StoreDir, TableId};
use std::collections::HashSet;
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of records checked.
    pub records_checked: usize,
    /// Problems found.
    pub errors: Vec<String>,
    /// Findings that recovery handles on its own.
    pub warnings: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path, check_wal: bool, check_data: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying store at {}", path.display());
    println!();

    let dir = StoreDir::open(path, true, 0o644)?;
    let mut ok = true;
    if check_wal {
        let result = verify_wal(&WalManager::new(dir.wal_backend()?, false));
        print_result("WAL", &result);
        ok &= result.is_ok();
    }
    if check_data {
        let result = verify_data(&SegmentManager::new(dir.data_backend()?));
        print_result("Data file", &result);
        ok &= result.is_ok();
    }

    println!();
    if ok {
        println!("Store verification passed");
        Ok(())
    } else {
        println!("Store verification failed");
        Err("verification failed".into())
    }
}

/// Checks record framing and transaction structure of the WAL.
pub fn verify_wal(wal: &WalManager) -> VerifyResult {
    let mut result = VerifyResult::default();
    let iter = match wal.iter() {
        Ok(iter) => iter,
        Err(err) => {
            result.errors.push(err.to_string());
            return result;
        }
    };
    let mut open: HashSet<u64> = HashSet::new();
    let mut last_sequence = 0;
    for item in iter {
        let (offset, record) = match item {
            Ok(entry) => entry,
            Err(err) => {
                result.errors.push(err.to_string());
                break;
            }
        };
        result.records_checked += 1;
        match record {
            WalRecord::Begin { txid } => {
                if !open.insert(txid.as_u64()) {
                    result.errors.push(format!("offset {offset}: transaction {txid} begun twice"));
                }
            }
            WalRecord::Put { txid, .. } | WalRecord::Delete { txid, .. } => {
                if !open.contains(&txid.as_u64()) {
                    result
                        .errors
                        .push(format!("offset {offset}: write outside transaction {txid}"));
                }
            }
            WalRecord::Commit { txid, sequence } => {
                if !open.remove(&txid.as_u64()) {
                    result
                        .errors
                        .push(format!("offset {offset}: commit of unknown transaction {txid}"));
                }
                if sequence.as_u64() <= last_sequence {
                    result.errors.push(format!(
                        "offset {offset}: sequence {sequence} after {last_sequence}"
                    ));
                }
                last_sequence = sequence.as_u64();
            }
            WalRecord::Checkpoint { sequence } => {
                last_sequence = last_sequence.max(sequence.as_u64());
            }
        }
    }
    if !open.is_empty() {
        result.warnings.push(format!(
            "{} uncommitted transaction(s) at the end of the log",
            open.len()
        ));
    }
    result
}

/// Checks data file records and decodes every stored object.
pub fn verify_data(data: &SegmentManager) -> VerifyResult {
    let mut result = VerifyResult::default();
    let outcome = match data.scan() {
        Ok(outcome) => outcome,
        Err(err) => {
            result.errors.push(err.to_string());
            return result;
        }
    };
    for (location, record) in &outcome.records {
        result.records_checked += 1;
        if record.is_tombstone() || !matches!(record.key.table, TableId::Objects(_)) {
            continue;
        }
        if let Err(err) = ObjectRecord::decode(&record.payload) {
            result.errors.push(format!(
                "offset {}: object {} of {}: {err}",
                location.offset, record.key.primary, record.key.table
            ));
        }
    }
    if outcome.torn_tail > 0 {
        result.warnings.push(format!(
            "{} bytes of an incomplete record after offset {}",
            outcome.torn_tail, outcome.valid_end
        ));
    }
    result
}

fn print_result(name: &str, result: &VerifyResult) {
    println!(
        "  {name}: {} records checked, {} errors",
        result.records_checked,
        result.errors.len()
    );
    for warning in &result.warnings {
        println!("    WARNING: {warning}");
    }
    for error in &result.errors {
        println!("    ERROR: {error}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boxdb_core::{RecordKey, SequenceNumber, TransactionId};
    use boxdb_storage::InMemoryBackend;

    fn wal_with(records: &[WalRecord]) -> WalManager {
        let wal = WalManager::new(Box::new(InMemoryBackend::new()), false);
        for record in records {
            wal.append(record).unwrap();
        }
        wal
    }

    #[test]
    fn clean_wal_passes() {
        let txid = TransactionId::new(1);
        let wal = wal_with(&[
            WalRecord::Begin { txid },
            WalRecord::Put {
                txid,
                key: RecordKey::object(1, 1),
                payload: ObjectRecord::new().with(2, "x").encode(),
            },
            WalRecord::Commit {
                txid,
                sequence: SequenceNumber::new(1),
            },
        ]);
        let result = verify_wal(&wal);
        assert!(result.is_ok(), "{:?}", result.errors);
        assert_eq!(result.records_checked, 3);
    }

    #[test]
    fn out_of_order_sequences_fail() {
        let (a, b) = (TransactionId::new(1), TransactionId::new(2));
        let wal = wal_with(&[
            WalRecord::Begin { txid: a },
            WalRecord::Commit {
                txid: a,
                sequence: SequenceNumber::new(5),
            },
            WalRecord::Begin { txid: b },
            WalRecord::Commit {
                txid: b,
                sequence: SequenceNumber::new(3),
            },
        ]);
        assert_eq!(verify_wal(&wal).errors.len(), 1);
    }

    #[test]
    fn unfinished_transaction_warns() {
        let txid = TransactionId::new(7);
        let wal = wal_with(&[WalRecord::Begin { txid }]);
        let result = verify_wal(&wal);
        assert!(result.is_ok());
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn empty_data_file_passes() {
        let data = SegmentManager::new(Box::new(InMemoryBackend::new()));
        let result = verify_data(&data);
        assert!(result.is_ok());
        assert_eq!(result.records_checked, 0);
    }
}
