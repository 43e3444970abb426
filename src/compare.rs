// ABOUTME: Block-by-block file comparison with a bounded checkpoint-synchronized retry protocol
// ABOUTME: Transient divergence from in-flight replication is retried; real mismatches are reported

use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::Result;

use crate::catalog::RelfilenodeEntry;
use crate::error::AuditError;
use crate::mask::mask_block;
use crate::page::{page_is_empty, page_is_new, page_is_verified, BLCKSZ};
use crate::report::{AuditWarning, WarningKind};
use crate::reltype::{classify, AccessMethod};
use crate::sync::{CancelToken, SyncGate};

/// If a file comparison fails, how many times to retry before admitting
/// that it really differs.
pub const NUM_RETRIES: u32 = 3;

enum Opened {
    File(File),
    Absent,
    Failed,
}

fn open_side(path: &Path) -> Opened {
    match File::open(path) {
        Ok(file) => Opened::File(file),
        Err(err) if err.kind() == ErrorKind::NotFound => Opened::Absent,
        Err(err) => {
            tracing::warn!("could not open file {}: {}", path.display(), err);
            Opened::Failed
        }
    }
}

/// Read the block at `blkno`, filling `buf` from the front. Returns the
/// number of bytes available at that offset, zero at end of file.
fn read_block(file: &mut File, blkno: u32, buf: &mut [u8]) -> std::io::Result<usize> {
    file.seek(SeekFrom::Start(blkno as u64 * BLCKSZ as u64))?;
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(total)
}

/// Compares a primary/mirror file pair block by block through the
/// checkpoint-synchronized retry protocol.
pub struct FileComparator<'a> {
    gate: &'a SyncGate<'a>,
    cancel: &'a CancelToken,
}

impl<'a> FileComparator<'a> {
    pub fn new(gate: &'a SyncGate<'a>, cancel: &'a CancelToken) -> Self {
        Self { gate, cancel }
    }

    /// Compare the two files, retrying transient divergence up to
    /// [`NUM_RETRIES`] times with a checkpoint-sync wait before each
    /// retry. The block cursor survives retries, so a retry resumes from
    /// the last block that had not yet compared equal rather than from
    /// the start of the file.
    ///
    /// Returns `Ok(true)` when the files match (including the case where
    /// both were concurrently removed), `Ok(false)` when a mismatch
    /// survived the retry budget or the mirror could not be synchronized.
    pub fn compare_files(
        &self,
        primary_path: &Path,
        mirror_path: &Path,
        entry: &RelfilenodeEntry,
        warnings: &mut Vec<AuditWarning>,
    ) -> Result<bool> {
        let category = classify(entry.relam, entry.relkind);
        let mut blockno: u32 = 0;
        let mut attempts: u32 = 0;
        let mut any_retries = false;

        // Any discrepancy below loops back here. Handles from the
        // previous attempt are dropped (closed) before reopening, so no
        // cached state survives a checkpoint.
        'attempt: loop {
            self.cancel.check()?;

            if attempts == NUM_RETRIES {
                let message = format!(
                    "{} files \"{}\" and \"{}\" for relation \"{}\" mismatch at blockno {}, gave up after {} retries",
                    category,
                    primary_path.display(),
                    mirror_path.display(),
                    entry.relname,
                    blockno,
                    attempts
                );
                tracing::warn!("{}", message);
                warnings.push(AuditWarning::new(WarningKind::Mismatch, message));
                return Ok(false);
            }
            attempts += 1;

            if attempts > 1 {
                any_retries = true;
                // Push a fresh checkpoint through to the mirror before
                // looking at the files again.
                match self.gate.wait_for_apply() {
                    Ok(true) => {}
                    Ok(false) => return Ok(false),
                    Err(err) => {
                        if matches!(
                            err.downcast_ref::<AuditError>(),
                            Some(AuditError::Cancelled)
                        ) {
                            return Err(err);
                        }
                        tracing::warn!("checkpoint sync failed: {:#}", err);
                        return Ok(false);
                    }
                }
            }

            let primary = open_side(primary_path);
            let mirror = open_side(mirror_path);

            let (mut primary_file, mut mirror_file) = match (primary, mirror) {
                (Opened::Absent, Opened::Absent) => {
                    tracing::info!(
                        "file \"{}\" was concurrently deleted on primary and mirror",
                        primary_path.display()
                    );
                    return Ok(true);
                }
                (Opened::Absent, _) => {
                    tracing::info!(
                        "file \"{}\" was concurrently deleted on primary",
                        primary_path.display()
                    );
                    continue 'attempt;
                }
                (_, Opened::Absent) => {
                    tracing::info!(
                        "file \"{}\" was concurrently deleted on mirror",
                        mirror_path.display()
                    );
                    continue 'attempt;
                }
                (Opened::File(p), Opened::File(m)) => (p, m),
                // Open failure on either side was already logged; retry.
                _ => continue 'attempt,
            };

            // Both files open. Compare block by block, resuming from the
            // cursor reached before a failed attempt.
            let mut primary_buf = vec![0u8; BLCKSZ];
            let mut mirror_buf = vec![0u8; BLCKSZ];

            loop {
                self.cancel.check()?;

                let primary_read = match read_block(&mut primary_file, blockno, &mut primary_buf)
                {
                    Ok(n) => n,
                    Err(err) => {
                        tracing::info!(
                            "could not read from file \"{}\", block {}: {}",
                            primary_path.display(),
                            blockno,
                            err
                        );
                        continue 'attempt;
                    }
                };
                let mirror_read = match read_block(&mut mirror_file, blockno, &mut mirror_buf) {
                    Ok(n) => n,
                    Err(err) => {
                        tracing::info!(
                            "could not read from file \"{}\", block {}: {}",
                            mirror_path.display(),
                            blockno,
                            err
                        );
                        continue 'attempt;
                    }
                };

                if primary_read != mirror_read {
                    tracing::info!(
                        "{} files \"{}\" and \"{}\" for relation \"{}\" mismatch at blockno {}, primary length: {}, mirror length: {}",
                        category,
                        primary_path.display(),
                        mirror_path.display(),
                        entry.relname,
                        blockno,
                        primary_read,
                        mirror_read
                    );
                    continue 'attempt;
                }

                if primary_read == 0 {
                    break; // reached EOF
                }

                let mut do_check = true;

                if entry.relam == AccessMethod::Heap {
                    if primary_read != BLCKSZ {
                        tracing::info!(
                            "short read of {} bytes from heap file \"{}\", block {}",
                            primary_read,
                            primary_path.display(),
                            blockno
                        );
                        continue 'attempt;
                    }

                    // Sanity-check both blocks before handing them to the
                    // maskers, which assume a well-formed page.
                    if !page_is_verified(&primary_buf, blockno) {
                        tracing::info!(
                            "invalid page header or checksum in heap file \"{}\", block {}",
                            primary_path.display(),
                            blockno
                        );
                        continue 'attempt;
                    }
                    if !page_is_verified(&mirror_buf, blockno) {
                        tracing::info!(
                            "invalid page header or checksum in heap file \"{}\", block {}",
                            mirror_path.display(),
                            blockno
                        );
                        continue 'attempt;
                    }

                    // Bulk extension initializes pages without logging
                    // them; on the mirror they stay zero-filled. Skip
                    // comparison for such pages.
                    if page_is_empty(&primary_buf) && page_is_new(&mirror_buf) {
                        do_check = false;
                    } else if !page_is_new(&primary_buf) && !page_is_new(&mirror_buf) {
                        mask_block(&mut primary_buf, blockno, entry.relam, entry.relkind);
                        mask_block(&mut mirror_buf, blockno, entry.relam, entry.relkind);
                    }
                }

                if do_check && primary_buf[..primary_read] != mirror_buf[..mirror_read] {
                    tracing::info!(
                        "{} files \"{}\" and \"{}\" for relation \"{}\" mismatch at blockno {}",
                        category,
                        primary_path.display(),
                        mirror_path.display(),
                        entry.relname,
                        blockno
                    );
                    continue 'attempt;
                }

                // Success. Advance to the next block and reset the
                // retry budget: exhaustion is per block, not per file.
                attempts = 1;
                blockno += 1;
            }

            // Reached end of both files successfully.
            //
            // The notices about transient differences can make the user
            // think something is wrong even though they are normal under
            // concurrent activity, so reassure them that it all matched
            // in the end.
            if any_retries {
                tracing::info!(
                    "files \"{}\" and \"{}\" succeeded after retrying",
                    primary_path.display(),
                    mirror_path.display()
                );
            }

            return Ok(true);
        }
    }
}
