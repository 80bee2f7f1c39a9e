// Live tests against a running server (cargo run --bin custodian) backed by
// Postgres. Run with: cargo test --test basic -- --include-ignored
use anyhow::Result;
use chrono::Utc;
use custodian::export::{verify_archive, ExportScope, ExportState};
use custodian::service::{Client, IngestRequest};
use custodian::storage::EvidenceSubmission;
use serial_test::serial;
use std::collections::BTreeMap;
use std::time::Duration;

async fn setup_client() -> Result<(Client, String)> {
    dotenv::dotenv().ok();
    let base = std::env::var("CUSTODIAN_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());
    let origin = std::env::var("CUSTODIAN_ORIGIN").unwrap_or_else(|_| custodian::config::DEFAULT_ORIGIN.to_string());
    Ok((Client::new(&base)?, origin))
}

/// Ids unique to this run so repeated runs never collide with logged content.
fn run_id() -> String {
    format!("run-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default())
}

fn request(tenant: &str, asset: &str, evidence: &str) -> IngestRequest {
    IngestRequest {
        submission: EvidenceSubmission {
            tenant_id: tenant.into(),
            asset_id: asset.into(),
            evidence_id: evidence.into(),
            manifest_hash: format!("{evidence}-manifest"),
            manifest: None,
            http_headers: BTreeMap::from([("server".into(), "live-test".into())]),
            verification_result: serde_json::json!({"ok": true}),
            operator_action: None,
        },
        legal_hold: false,
    }
}

#[ignore]
#[serial]
#[tokio::test]
async fn test_inclusion_proofs() -> Result<()> {
    let (client, origin) = setup_client().await?;
    let tenant = run_id();

    let mut receipts = Vec::new();
    for evidence in ["e1", "e2", "e3", "e4", "e5"] {
        receipts.push(client.ingest(&request(&tenant, "asset", evidence)).await?);
    }

    let (root, size) = client.get_root(&origin).await?;
    for receipt in &receipts {
        let proof = client.get_inclusion_proof(&origin, receipt.leaf_index, Some(size)).await?;
        assert_eq!(proof.root_hash, root);
        assert!(proof.proof.verify(&root), "leaf {} should verify", receipt.leaf_index);
        println!("✅ Verified inclusion proof for leaf {}", receipt.leaf_index);
    }
    Ok(())
}

#[ignore]
#[serial]
#[tokio::test]
async fn test_consistency_proofs() -> Result<()> {
    let (client, origin) = setup_client().await?;
    let tenant = run_id();

    let mut observed = Vec::new();
    for i in 0..3 {
        client.ingest(&request(&tenant, "asset", &format!("batch{i}"))).await?;
        let (root, size) = client.get_root(&origin).await?;
        observed.push((size, root));
    }

    for (size, root) in &observed {
        let (_, current) = client.verify_tree_consistency(&origin, *size, root).await?;
        assert!(current >= *size);
        println!("✅ Tree at size {size} is a prefix of size {current}");
    }
    Ok(())
}

#[ignore]
#[serial]
#[tokio::test]
async fn test_checkpoints_are_signed_and_chained() -> Result<()> {
    let (client, origin) = setup_client().await?;
    let tenant = run_id();

    client.ingest(&request(&tenant, "asset", "before")).await?;
    let first = client.create_checkpoint(&origin).await?;
    assert!(first.verify_signature(&first.public_key));

    client.ingest(&request(&tenant, "asset", "after")).await?;
    let second = client.create_checkpoint(&origin).await?;
    assert!(second.tree_size > first.tree_size);

    let proof = client
        .get_consistency_proof(&origin, first.tree_size, Some(second.tree_size))
        .await?;
    assert!(proof.proof.verify(&first.root_hash, &second.root_hash));
    Ok(())
}

#[ignore]
#[serial]
#[tokio::test]
async fn test_export_roundtrip() -> Result<()> {
    let (client, _) = setup_client().await?;
    let tenant = run_id();

    client.ingest(&request(&tenant, "asset", "e1")).await?;
    client.ingest(&request(&tenant, "asset", "e2")).await?;

    let started = client
        .create_export(&ExportScope::Tenant {
            tenant_id: tenant.clone(),
        })
        .await?;
    let mut status = client.get_export(&started.export_id).await?;
    while status.state == ExportState::Building {
        tokio::time::sleep(Duration::from_millis(100)).await;
        status = client.get_export(&started.export_id).await?;
    }
    assert_eq!(status.state, ExportState::Ready, "{:?}", status.error);

    let link = client.export_link(&started.export_id, 60).await?;
    let archive = client.download(&link.token).await?;
    let key = std::env::var("CUSTODIAN_EXPORT_PUBLIC_KEY")?;
    let report = verify_archive(&archive, &hex::decode(key)?, None)?;
    assert!(report.passed());
    assert_eq!(report.records, 2);
    Ok(())
}

#[ignore]
#[serial]
#[tokio::test]
async fn test_metrics_and_admin() -> Result<()> {
    let (client, _) = setup_client().await?;

    let metrics = client.get_metrics().await?;
    println!("📊 tree size {}, checkpoints {}", metrics.counters.tree_size, metrics.counters.checkpoints);

    assert_eq!(client.admin("pause").await?, "paused");
    assert_eq!(client.processor_status().await?, "paused");
    assert_eq!(client.admin("resume").await?, "running");
    Ok(())
}
