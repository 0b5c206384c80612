// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic inspection-sync usage example.
//!
//! Demonstrates:
//! 1. An in-process server and two offline tablets
//! 2. Building an assessment tree on one tablet and syncing it out
//! 3. Conflicting edits to the same fire-safety item, merged deterministically
//! 4. Moving photo bytes by content hash
//!
//! # Run
//!
//! ```bash
//! RUST_LOG=inspection_sync=debug cargo run --example basic_usage
//! ```

use std::sync::Arc;

use inspection_sync::{
    BlobSync, EntityKind, FireSafetyItemFields, InMemoryStore, ItemStatus, LoopbackBlobTransport, LoopbackTransport,
    ParentRef, Replica, RetryConfig, SyncConfig, SyncControl, SyncEngine, SyncServer,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("inspection_sync=info")))
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           inspection-sync: Basic Usage Example                ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Server and tablets
    // ─────────────────────────────────────────────────────────────────────────
    let server_config = SyncConfig { replica_id: "server".into(), ..Default::default() };
    let (server_replica, server_blobs) = Replica::open(&server_config).await?;
    let server = Arc::new(SyncServer::new(Arc::new(server_replica)));

    let tablet = |id: &str| {
        let replica = Arc::new(Replica::new(id, Arc::new(InMemoryStore::new()), "server"));
        SyncEngine::new(replica, Arc::new(LoopbackTransport::new(server.clone())), "server")
    };
    let north = tablet("tablet-north");
    let south = tablet("tablet-south");
    let control = SyncControl::from_config(&server_config);

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Build a tree offline and sync it out
    // ─────────────────────────────────────────────────────────────────────────
    println!("📝 Recording an inspection on tablet-north...");
    let assessment = north
        .replica()
        .create(EntityKind::Assessment, None, json!({"property_name": "Riverside Depot"}))
        .await?;
    let floor = north
        .replica()
        .create(
            EntityKind::Floor,
            Some(ParentRef::new(EntityKind::Assessment, assessment.id.clone())),
            json!({"floor_name": "Ground", "floor_number": 0}),
        )
        .await?;
    let room = north
        .replica()
        .create(
            EntityKind::Room,
            Some(ParentRef::new(EntityKind::Floor, floor.id.clone())),
            json!({"room_name": "Plant room", "connections": []}),
        )
        .await?;
    let item = north
        .replica()
        .create_typed(
            Some(ParentRef::new(EntityKind::Room, room.id.clone())),
            &FireSafetyItemFields {
                item_code: Some("EXT-01".into()),
                item_type: Some("extinguisher".into()),
                ..Default::default()
            },
        )
        .await?;

    let report = north.sync(&control).await?;
    println!("   north pushed {} (accepted {})", report.pushed, report.accepted);
    let report = south.sync(&control).await?;
    println!("   south pulled {}", report.pulled);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Concurrent edits
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n⚔️  Both tablets edit {} offline...", item.id);
    north
        .replica()
        .update_typed(
            &item.id,
            &FireSafetyItemFields {
                item_code: Some("EXT-01".into()),
                item_type: Some("extinguisher".into()),
                status: ItemStatus::Fail,
                failure_reason: Some("pressure low".into()),
                ..Default::default()
            },
        )
        .await?;
    south
        .replica()
        .update_typed(
            &item.id,
            &FireSafetyItemFields {
                item_code: Some("EXT-01".into()),
                item_type: Some("extinguisher".into()),
                notes: Some("serviced on site".into()),
                ..Default::default()
            },
        )
        .await?;

    for engine in [&north, &south, &north] {
        let report = engine.sync(&control).await?;
        println!(
            "   {} pushed {} conflicts {} pulled {}",
            engine.replica().id(),
            report.pushed,
            report.conflicts,
            report.pulled
        );
    }

    let merged: Option<FireSafetyItemFields> = north.replica().get_typed(&item.id).await?;
    let other: Option<FireSafetyItemFields> = south.replica().get_typed(&item.id).await?;
    println!("   converged: {}", merged == other);
    if let Some(fields) = merged {
        println!("   status {:?}, notes {:?}", fields.status, fields.notes);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Photos
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📷 Attaching a photo on tablet-south...");
    let south_blobs = Arc::new(InMemoryStore::new());
    let south_photos = BlobSync::new(
        south_blobs.clone(),
        Arc::new(LoopbackBlobTransport::new(server_blobs.clone())),
        RetryConfig::query(),
    );
    let hash = south_photos.store_local(b"jpeg bytes of the extinguisher tag").await?;
    south
        .replica()
        .create(
            EntityKind::Photo,
            Some(ParentRef::new(EntityKind::FireSafetyItem, item.id.clone())),
            json!({"caption": "Service tag", "content_hash": hash}),
        )
        .await?;
    south.sync(&control).await?;
    let uploaded = south_photos.run(south.replica()).await?;
    println!("   uploaded {} blob(s)", uploaded.uploaded);

    north.sync(&control).await?;
    let north_photos = BlobSync::new(
        Arc::new(InMemoryStore::new()),
        Arc::new(LoopbackBlobTransport::new(server_blobs)),
        RetryConfig::query(),
    );
    let downloaded = north_photos.run(north.replica()).await?;
    println!("   north downloaded {} blob(s), complete: {}", downloaded.downloaded, downloaded.is_complete());

    println!("\n✅ Done");
    Ok(())
}
