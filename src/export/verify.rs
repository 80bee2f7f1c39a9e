//! Offline archive verification.
//!
//! Needs nothing but the archive bytes and the exporter's public key: every
//! check is recomputed from the packaged files.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::archive::{self, ArchiveFiles};
use super::index::{names, ExportIndex, LeafProof, INDEX_FORMAT};
use crate::error::Result;
use crate::log::{Checkpoint, EntryType, EvidencePointer};
use crate::signing::verify_signature;
use crate::storage::evidence::{MANIFEST_FILE, RECORD_FILE, TIMESTAMP_FILE};
use crate::storage::object::sha256_hex;
use crate::storage::EvidenceRecord;
use crate::tsa::TstInfo;

/// Kind of check, as reported.
pub mod checks {
    /// `index.sig` over `index.json`
    pub const INDEX_SIGNATURE: &str = "index_signature";
    /// `index.json` parses and has a known format
    pub const INDEX_FORMAT: &str = "index_format";
    /// `checkpoint.json` signature
    pub const CHECKPOINT_SIGNATURE: &str = "checkpoint_signature";
    /// Index and checkpoint name the same tree
    pub const CHECKPOINT_MATCHES_INDEX: &str = "checkpoint_matches_index";
    /// Listed file digest and size
    pub const FILE_DIGEST: &str = "file_digest";
    /// File present but not listed
    pub const UNLISTED_FILE: &str = "unlisted_file";
    /// Leaf proof against the checkpoint root
    pub const INCLUSION_PROOF: &str = "inclusion_proof";
    /// Logged pointer matches the packaged record and its siblings
    pub const RECORD_BINDING: &str = "record_binding";
    /// Time-stamp imprint covers the record content
    pub const TSA_IMPRINT: &str = "tsa_imprint";
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Check {
    /// One of [`checks`]
    pub name: String,
    /// File or directory checked
    pub target: String,
    /// Whether it held
    pub passed: bool,
    /// Why it failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Every check run against one archive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Export id from the index, when it could be read
    pub export_id: Option<String>,
    /// Records listed in the index
    pub records: usize,
    /// Checks in the order they ran
    pub checks: Vec<Check>,
}

impl VerificationReport {
    /// True when at least one check ran and every check passed.
    pub fn passed(&self) -> bool {
        !self.checks.is_empty() && self.checks.iter().all(|c| c.passed)
    }

    /// Checks that failed.
    pub fn failures(&self) -> impl Iterator<Item = &Check> {
        self.checks.iter().filter(|c| !c.passed)
    }

    fn record(&mut self, name: &str, target: &str, outcome: std::result::Result<(), String>) {
        self.checks.push(Check {
            name: name.to_string(),
            target: target.to_string(),
            passed: outcome.is_ok(),
            detail: outcome.err(),
        });
    }
}

fn ensure(cond: bool, detail: impl FnOnce() -> String) -> std::result::Result<(), String> {
    if cond {
        Ok(())
    } else {
        Err(detail())
    }
}

/// Verifies archive bytes.
///
/// `export_key` is the exporter's raw public key. `log_key`, when given,
/// pins the checkpoint signer; otherwise the key recorded in the
/// checkpoint is used.
///
/// # Errors
///
/// Returns `Error::Serialization` only if the bytes are not a readable
/// archive. Everything else is reported as a failed check.
pub fn verify_archive(
    bytes: &[u8],
    export_key: &[u8],
    log_key: Option<&[u8]>,
) -> Result<VerificationReport> {
    let files = archive::unpack(bytes)?;
    Ok(verify_files(&files, export_key, log_key))
}

/// Verifies an unpacked archive.
pub fn verify_files(
    files: &ArchiveFiles,
    export_key: &[u8],
    log_key: Option<&[u8]>,
) -> VerificationReport {
    let mut report = VerificationReport::default();

    let Some(index_bytes) = files.get(names::INDEX) else {
        report.record(checks::INDEX_FORMAT, names::INDEX, Err("missing".into()));
        return report;
    };
    let signature = files
        .get(names::INDEX_SIG)
        .and_then(|s| std::str::from_utf8(s).ok())
        .and_then(|s| hex::decode(s.trim()).ok());
    report.record(
        checks::INDEX_SIGNATURE,
        names::INDEX_SIG,
        match signature {
            None => Err("missing or not hex".into()),
            Some(sig) => ensure(verify_signature(export_key, index_bytes, &sig), || {
                "signature does not verify under the supplied key".into()
            }),
        },
    );

    let index: ExportIndex = match serde_json::from_slice(index_bytes) {
        Ok(index) => index,
        Err(e) => {
            report.record(checks::INDEX_FORMAT, names::INDEX, Err(e.to_string()));
            return report;
        }
    };
    report.export_id = Some(index.export_id.clone());
    report.records = index.records.len();
    report.record(
        checks::INDEX_FORMAT,
        names::INDEX,
        ensure(index.format == INDEX_FORMAT, || {
            format!("unknown format '{}'", index.format)
        }),
    );

    let checkpoint = verify_checkpoint(files, &index, log_key, &mut report);
    verify_listing(files, &index, &mut report);
    for record in &index.records {
        verify_record(files, record, checkpoint.as_ref(), &mut report);
    }

    tracing::info!(
        export_id = %index.export_id,
        checks = report.checks.len(),
        failed = report.failures().count(),
        "archive verified"
    );
    report
}

fn verify_checkpoint(
    files: &ArchiveFiles,
    index: &ExportIndex,
    log_key: Option<&[u8]>,
    report: &mut VerificationReport,
) -> Option<Checkpoint> {
    let parsed = files
        .get(names::CHECKPOINT)
        .ok_or_else(|| "missing".to_string())
        .and_then(|b| serde_json::from_slice::<Checkpoint>(b).map_err(|e| e.to_string()));
    let checkpoint = match parsed {
        Ok(cp) => cp,
        Err(e) => {
            report.record(checks::CHECKPOINT_SIGNATURE, names::CHECKPOINT, Err(e));
            return None;
        }
    };

    let key = log_key.unwrap_or(&checkpoint.public_key);
    report.record(
        checks::CHECKPOINT_SIGNATURE,
        names::CHECKPOINT,
        ensure(checkpoint.verify_signature(key), || {
            "checkpoint signature does not verify".into()
        }),
    );
    report.record(
        checks::CHECKPOINT_MATCHES_INDEX,
        names::CHECKPOINT,
        ensure(
            checkpoint.origin == index.origin
                && checkpoint.tree_size == index.tree_size
                && checkpoint.root_hash == index.root_hash,
            || "index names a different tree than the checkpoint".into(),
        ),
    );
    Some(checkpoint)
}

fn verify_listing(files: &ArchiveFiles, index: &ExportIndex, report: &mut VerificationReport) {
    let mut listed = HashSet::new();
    for file in &index.files {
        listed.insert(file.path.as_str());
        let outcome = match files.get(&file.path) {
            None => Err("listed but missing".to_string()),
            Some(data) => {
                let digest = sha256_hex(data);
                ensure(digest == file.sha256 && data.len() as u64 == file.size, || {
                    format!("sha256 {digest} size {} differ from the index", data.len())
                })
            }
        };
        report.record(checks::FILE_DIGEST, &file.path, outcome);
    }
    for path in files.keys() {
        if path != names::INDEX && path != names::INDEX_SIG && !listed.contains(path.as_str()) {
            report.record(checks::UNLISTED_FILE, path, Err("not listed in the index".into()));
        }
    }
}

fn verify_record(
    files: &ArchiveFiles,
    indexed: &super::index::IndexedRecord,
    checkpoint: Option<&Checkpoint>,
    report: &mut VerificationReport,
) {
    let dir = indexed.dir.as_str();
    let leaf = files
        .get(&format!("{dir}{}", names::INCLUSION_PROOF))
        .ok_or_else(|| "missing inclusion proof".to_string())
        .and_then(|b| serde_json::from_slice::<LeafProof>(b).map_err(|e| e.to_string()));
    let leaf = match leaf {
        Ok(leaf) => leaf,
        Err(e) => {
            report.record(checks::INCLUSION_PROOF, dir, Err(e));
            return;
        }
    };

    let inclusion = match (checkpoint, leaf.entry.leaf_hash()) {
        (None, _) => Err("no usable checkpoint".to_string()),
        (_, Err(e)) => Err(e.to_string()),
        (Some(cp), Ok(hash)) => ensure(hash == leaf.proof.leaf_hash, || {
            "packaged entry does not hash to the proven leaf".into()
        })
        .and_then(|()| {
            ensure(
                leaf.proof.leaf_index == indexed.leaf_index && leaf.proof.tree_size == cp.tree_size,
                || "proof is for a different leaf or tree size".into(),
            )
        })
        .and_then(|()| {
            ensure(leaf.proof.verify(&cp.root_hash), || {
                "proof does not reach the checkpoint root".into()
            })
        }),
    };
    report.record(checks::INCLUSION_PROOF, dir, inclusion);

    let record = files
        .get(&format!("{dir}{RECORD_FILE}"))
        .ok_or_else(|| "missing record".to_string())
        .and_then(|bytes| {
            serde_json::from_slice::<EvidenceRecord>(bytes)
                .map(|record| (sha256_hex(bytes), record))
                .map_err(|e| e.to_string())
        });
    let (record_sha256, record) = match record {
        Ok(parsed) => parsed,
        Err(e) => {
            report.record(checks::RECORD_BINDING, dir, Err(e));
            return;
        }
    };
    report.record(
        checks::RECORD_BINDING,
        dir,
        bind_record(files, indexed, &leaf, &record_sha256, &record),
    );

    if let Some(token) = files.get(&format!("{dir}{TIMESTAMP_FILE}")) {
        let outcome = match (TstInfo::from_token(token), record.content.canonical_bytes()) {
            (Err(e), _) => Err(format!("unparseable token: {e}")),
            (_, Err(e)) => Err(e.to_string()),
            (Ok(info), Ok(content)) => ensure(info.covers(&content), || {
                format!("token imprint does not cover the record (genTime {})", info.gen_time)
            }),
        };
        report.record(checks::TSA_IMPRINT, dir, outcome);
    }
}

/// The logged pointer names exactly the packaged record, and the sibling
/// artifacts agree with it.
fn bind_record(
    files: &ArchiveFiles,
    indexed: &super::index::IndexedRecord,
    leaf: &LeafProof,
    record_sha256: &str,
    record: &EvidenceRecord,
) -> std::result::Result<(), String> {
    ensure(leaf.entry.entry_type == EntryType::EvidenceStored, || {
        format!("leaf is a {} entry", leaf.entry.entry_type)
    })?;
    let pointer: EvidencePointer = leaf.entry.payload_json().map_err(|e| e.to_string())?;
    ensure(
        pointer.object_key == indexed.object_key && pointer.version_id == indexed.version_id,
        || "logged pointer names a different object version".into(),
    )?;
    ensure(pointer.record_sha256 == record_sha256, || {
        "record bytes differ from the logged version".into()
    })?;
    let content_hash = record.content.content_hash().map_err(|e| e.to_string())?;
    ensure(
        content_hash == pointer.content_hash && content_hash == record.content_hash,
        || "content hash does not match".into(),
    )?;

    let headers = files
        .get(&format!("{}{}", indexed.dir, names::HEADERS))
        .and_then(|b| serde_json::from_slice::<serde_json::Value>(b).ok());
    let headers_expected = serde_json::to_value(&record.content.http_headers).ok();
    ensure(headers.is_some() && headers == headers_expected, || {
        "headers.json disagrees with the record".into()
    })?;
    let verification = files
        .get(&format!("{}{}", indexed.dir, names::VERIFICATION))
        .and_then(|b| serde_json::from_slice::<serde_json::Value>(b).ok());
    ensure(
        verification.as_ref() == Some(&record.content.verification_result),
        || "verification.json disagrees with the record".into(),
    )?;

    let manifest = files.get(&format!("{}{MANIFEST_FILE}", indexed.dir));
    ensure(
        manifest.map(|m| sha256_hex(m)) == record.content.manifest_sha256,
        || "manifest.bin disagrees with the record".into(),
    )
}
