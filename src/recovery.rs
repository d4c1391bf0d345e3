//! Recovery engine: replays the side log left behind by a
//! flush that crashed between writing it and deleting it, then discards it.

use log::{info, warn};

use crate::error::FsResult;
use crate::host::{BlockDevice, RecoveryLog};
use crate::node::NODE_SIZE;

/// Applies every committed record in `log` to `disk`, in log order (the
/// metadata block's pre-image, if present, is always the last record
/// appended during flush and is therefore replayed last here too), then
/// deletes the log. A no-op, successfully, if no log exists.
pub fn recover<B: BlockDevice + ?Sized, L: RecoveryLog + ?Sized>(
    disk: &mut B,
    log: &mut L,
) -> FsResult {
    if !log.exists()? {
        return Ok(());
    }

    let records = log.replay()?;
    info!("replaying {} recovery log record(s)", records.len());
    for record in &records {
        debug_assert_eq!(record.preimage.len(), NODE_SIZE);
        disk.write_block(record.physical_number, &record.preimage)?;
    }
    disk.flush()?;
    log.delete()?;
    if !records.is_empty() {
        warn!("recovered from an interrupted flush");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::mem_env::{MemBlockDevice, MemRecoveryLog};
    use crate::host::RecoveryRecord;

    #[test]
    fn replays_committed_records_and_deletes_log() {
        let mut disk = MemBlockDevice::new();
        let mut log = MemRecoveryLog::new();
        log.create().unwrap();
        log.append(&RecoveryRecord {
            physical_number: 5,
            preimage: vec![9u8; NODE_SIZE],
        })
        .unwrap();
        log.commit().unwrap();

        recover(&mut disk, &mut log).unwrap();

        let mut buf = [0u8; NODE_SIZE];
        disk.read_block(5, &mut buf).unwrap();
        assert_eq!(buf, [9u8; NODE_SIZE]);
        assert!(!log.exists().unwrap());
    }

    #[test]
    fn uncommitted_tail_is_not_replayed() {
        let mut disk = MemBlockDevice::new();
        let mut log = MemRecoveryLog::new();
        log.create().unwrap();
        log.append(&RecoveryRecord {
            physical_number: 1,
            preimage: vec![1u8; NODE_SIZE],
        })
        .unwrap();
        log.commit().unwrap();
        log.append(&RecoveryRecord {
            physical_number: 2,
            preimage: vec![2u8; NODE_SIZE],
        })
        .unwrap();
        // crash before the second record's commit marker
        log.crash_after_last_commit();

        recover(&mut disk, &mut log).unwrap();

        let mut buf = [0u8; NODE_SIZE];
        disk.read_block(1, &mut buf).unwrap();
        assert_eq!(buf, [1u8; NODE_SIZE]);
        disk.read_block(2, &mut buf).unwrap();
        assert_eq!(buf, [0u8; NODE_SIZE]);
    }

    #[test]
    fn no_log_is_a_no_op() {
        let mut disk = MemBlockDevice::new();
        let mut log = MemRecoveryLog::new();
        assert!(recover(&mut disk, &mut log).is_ok());
    }
}
