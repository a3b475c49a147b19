//! Integration tests for settings instances.
//!
//! Tokio time is paused: timers fire as soon as every task is idle, so the
//! debounce, keepalive and timeout paths run instantly and deterministically.

mod common;

use std::time::Duration;

use common::{wait_for_status, wait_for_value, Harness};
use serde_json::json;
use tally_client::{
    DurableStorage, FileStorage, SettingsHandle, SyncBuilder, SyncConfig, SyncError,
    TransportKind, TransportPreference,
};
use tally_engine::{OfflineBackup, Schema};
use tokio::time::{advance, Instant};

fn backup(harness: &Harness) -> OfflineBackup {
    harness
        .storage
        .get("settings.pending")
        .unwrap()
        .map(|bytes| OfflineBackup::from_bytes(&bytes).unwrap())
        .unwrap_or_default()
}

async fn reconciled(handle: &SettingsHandle) {
    wait_for_status(handle, |s| s.last_reconciled > 0 && s.pending == 0 && !s.syncing).await;
}

// ============================================================================
// Change buffer and debounce
// ============================================================================

#[tokio::test(start_paused = true)]
async fn burst_of_edits_yields_one_attempt_with_final_value() {
    let harness = Harness::new();
    let tab = harness.tab("tab-a").spawn();

    for theme in ["light", "dark", "system", "dark"] {
        tab.record_change("theme", json!(theme)).await.unwrap();
        advance(Duration::from_millis(200)).await;
    }

    // Last edit at 600ms, so the gate opens at 1600ms
    advance(Duration::from_millis(700)).await;
    tab.barrier().await.unwrap();
    assert!(harness.authority.requests().is_empty());

    advance(Duration::from_millis(200)).await;
    reconciled(&tab).await;

    let requests = harness.authority.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].changes.len(), 1);
    assert_eq!(requests[0].changes["theme"], json!("dark"));
    assert_eq!(harness.authority.value("theme"), Some(json!("dark")));
}

#[tokio::test(start_paused = true)]
async fn edits_apply_locally_and_persist_immediately() {
    let harness = Harness::new();
    let tab = harness.tab("tab-a").spawn();

    let stamp = tab.record_change("currency", json!("EUR")).await.unwrap();

    assert_eq!(stamp, 1_000);
    assert_eq!(tab.get_field("currency"), Some(json!("EUR")));
    assert_eq!(tab.status().pending, 1);

    let bytes = harness.storage.get("settings.document").unwrap().unwrap();
    let persisted = tally_engine::PersistedDocument::from_bytes(&bytes).unwrap();
    assert_eq!(persisted.document.get("currency"), Some(&json!("EUR")));
}

#[tokio::test(start_paused = true)]
async fn invalid_changes_are_rejected_synchronously() {
    let harness = Harness::new();
    let tab = harness.tab("tab-a").spawn();

    let err = tab.record_change("theme", json!("neon")).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Validation(tally_engine::Error::InvalidValue { .. })
    ));

    let err = tab.record_change("fontSize", json!(14)).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Validation(tally_engine::Error::UnknownField(_))
    ));

    let err = tab.record_change("decimalPlaces", json!("two")).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Validation(tally_engine::Error::TypeMismatch { .. })
    ));

    advance(Duration::from_secs(5)).await;
    tab.barrier().await.unwrap();

    assert_eq!(tab.status().pending, 0);
    assert_eq!(tab.get_field("theme"), Some(json!("system")));
    assert!(harness.authority.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn edit_during_flight_is_sent_next() {
    let harness = Harness::new();
    harness.authority.set_delay(Some(Duration::from_secs(2)));
    let tab = harness.tab("tab-a").spawn();

    tab.record_change("theme", json!("dark")).await.unwrap();
    wait_for_status(&tab, |s| s.syncing).await;

    // Its quiet period ends while the first exchange is still out
    tab.record_change("currency", json!("GBP")).await.unwrap();
    reconciled(&tab).await;

    let requests = harness.authority.content_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].changes.keys().collect::<Vec<_>>(), vec!["theme"]);
    assert_eq!(requests[1].changes.keys().collect::<Vec<_>>(), vec!["currency"]);
}

#[tokio::test(start_paused = true)]
async fn reset_restores_defaults_and_syncs_them() {
    let harness = Harness::new();
    let tab = harness.tab("tab-a").spawn();

    tab.record_change("theme", json!("dark")).await.unwrap();
    tab.record_change("compactMode", json!(true)).await.unwrap();
    tab.reset_to_defaults().await.unwrap();

    assert_eq!(tab.get_field("theme"), Some(json!("system")));
    assert_eq!(tab.get_field("compactMode"), Some(json!(false)));
    assert_eq!(tab.status().pending, Schema::finance().fields.len());

    reconciled(&tab).await;
    assert_eq!(harness.authority.value("theme"), Some(json!("system")));
}

// ============================================================================
// Connectivity
// ============================================================================

#[tokio::test(start_paused = true)]
async fn timeout_goes_offline_and_reconnect_retries_immediately() {
    let harness = Harness::new();
    harness.authority.set_delay(Some(Duration::from_secs(10)));
    let tab = harness.tab("tab-a").spawn();

    tab.record_change("theme", json!("dark")).await.unwrap();

    let status = wait_for_status(&tab, |s| !s.online).await;
    assert_eq!(status.pending, 1);
    assert_eq!(status.last_reconciled, 0);
    assert_eq!(status.last_error.as_deref(), Some("exchange timed out after 5s"));

    // Never applied remotely, kept pending and backed up
    assert_eq!(harness.authority.value("theme"), None);
    assert_eq!(backup(&harness).get("theme").unwrap().value, json!("dark"));

    harness.authority.set_delay(None);
    let before = Instant::now();
    tab.set_reachable(true).unwrap();
    reconciled(&tab).await;

    // No debounce delay on reconnect
    assert!(Instant::now() - before < Duration::from_secs(1));
    assert_eq!(harness.authority.value("theme"), Some(json!("dark")));
    assert!(backup(&harness).is_empty());
}

#[tokio::test(start_paused = true)]
async fn offline_edits_wait_for_reconnect() {
    let harness = Harness::new();
    let tab = harness.tab("tab-a").reachable(false).spawn();

    tab.record_change("language", json!("pt")).await.unwrap();
    advance(Duration::from_secs(2)).await;
    tab.barrier().await.unwrap();

    assert!(harness.authority.requests().is_empty());
    assert_eq!(backup(&harness).get("language").unwrap().value, json!("pt"));

    tab.set_reachable(true).unwrap();
    reconciled(&tab).await;

    let requests = harness.authority.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].changes["language"], json!("pt"));
}

#[tokio::test(start_paused = true)]
async fn keepalive_probes_after_transport_failure() {
    let harness = Harness::new();
    harness.authority.set_unreachable(true);
    let tab = harness
        .tab("tab-a")
        .config(SyncConfig {
            keepalive: Some(Duration::from_secs(30)),
            ..Harness::config()
        })
        .spawn();

    tab.record_change("weekStartsOn", json!("sunday")).await.unwrap();
    wait_for_status(&tab, |s| !s.online).await;

    // The authority comes back; the next keepalive tick notices
    harness.authority.set_unreachable(false);
    reconciled(&tab).await;

    assert!(tab.status().online);
    assert_eq!(harness.authority.value("weekStartsOn"), Some(json!("sunday")));
}

#[tokio::test(start_paused = true)]
async fn keepalive_picks_up_remote_only_updates() {
    let harness = Harness::new();
    harness.authority.seed("currency", json!("JPY"), 5_000);
    let tab = harness
        .tab("tab-a")
        .config(SyncConfig {
            keepalive: Some(Duration::from_secs(30)),
            ..Harness::config()
        })
        .spawn();

    wait_for_value(&tab, "currency", json!("JPY")).await;

    let requests = harness.authority.requests();
    assert!(requests[0].changes.is_empty());
    assert_eq!(requests[0].cursor, 0);
}

// ============================================================================
// Startup
// ============================================================================

#[tokio::test(start_paused = true)]
async fn startup_fetch_adopts_remote_state() {
    let harness = Harness::new();
    harness.authority.seed("theme", json!("light"), 900);
    harness.authority.seed("decimalPlaces", json!(0), 950);

    let tab = harness
        .tab("tab-a")
        .config(SyncConfig {
            sync_on_start: true,
            ..Harness::config()
        })
        .spawn();

    wait_for_value(&tab, "decimalPlaces", json!(0)).await;
    assert_eq!(tab.get_field("theme"), Some(json!("light")));
    assert_eq!(harness.authority.snapshot_calls(), 1);
    // Nothing pending, nothing to submit
    assert!(harness.authority.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_changes_survive_restart() {
    let harness = Harness::new();
    harness.authority.set_unreachable(true);

    let tab = harness.tab("tab-a").spawn();
    tab.record_change("budgetAlertThreshold", json!(65)).await.unwrap();
    wait_for_status(&tab, |s| !s.online).await;
    tab.shutdown().await.unwrap();
    assert!(matches!(tab.barrier().await, Err(SyncError::Closed)));

    harness.authority.set_unreachable(false);
    let restarted = harness
        .tab("tab-a-restarted")
        .config(SyncConfig {
            sync_on_start: true,
            ..Harness::config()
        })
        .spawn();

    assert_eq!(restarted.get_field("budgetAlertThreshold"), Some(json!(65)));
    reconciled(&restarted).await;

    assert_eq!(harness.authority.value("budgetAlertThreshold"), Some(json!(65)));
    assert!(backup(&harness).is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_backs_up_exchange_in_flight() {
    let harness = Harness::new();
    harness.authority.set_delay(Some(Duration::from_secs(3)));

    let tab = harness.tab("tab-a").spawn();
    tab.record_change("notificationsEnabled", json!(false)).await.unwrap();
    wait_for_status(&tab, |s| s.syncing).await;
    tab.shutdown().await.unwrap();

    assert_eq!(
        backup(&harness).get("notificationsEnabled").unwrap().value,
        json!(false)
    );
}

// ============================================================================
// Convergence across devices
// ============================================================================

async fn disjoint_offline_edits(phone_first: bool) {
    let harness = Harness::new();
    let phone = harness.device("phone").reachable(false).spawn();
    let laptop = harness.device("laptop").reachable(false).spawn();

    phone.record_change("theme", json!("dark")).await.unwrap();
    laptop.record_change("currency", json!("EUR")).await.unwrap();
    advance(Duration::from_secs(2)).await;

    let (first, second) = if phone_first {
        (&phone, &laptop)
    } else {
        (&laptop, &phone)
    };

    harness.clock.advance(10);
    first.set_reachable(true).unwrap();
    reconciled(first).await;

    harness.clock.advance(10);
    second.set_reachable(true).unwrap();
    reconciled(second).await;

    // The first device catches up on its next exchange
    harness.clock.advance(10);
    first.request_sync().unwrap();

    for device in [&phone, &laptop] {
        wait_for_value(device, "theme", json!("dark")).await;
        wait_for_value(device, "currency", json!("EUR")).await;
    }
    assert!(phone.snapshot().same_values(&laptop.snapshot()));

    // The second device resubmitted only its own field
    let requests = harness.authority.content_requests();
    let last = requests.last().unwrap();
    assert_eq!(last.changes.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn disjoint_offline_edits_converge_phone_first() {
    disjoint_offline_edits(true).await;
}

#[tokio::test(start_paused = true)]
async fn disjoint_offline_edits_converge_laptop_first() {
    disjoint_offline_edits(false).await;
}

#[tokio::test(start_paused = true)]
async fn newer_local_edit_survives_conflict() {
    let harness = Harness::new();
    harness.authority.seed("theme", json!("light"), 900);
    harness.authority.seed("currency", json!("EUR"), 950);
    harness.clock.set(2_000);

    let tab = harness.tab("tab-a").spawn();
    tab.record_change("theme", json!("dark")).await.unwrap();
    reconciled(&tab).await;

    assert_eq!(tab.get_field("theme"), Some(json!("dark")));
    assert_eq!(tab.get_field("currency"), Some(json!("EUR")));
    assert_eq!(harness.authority.value("theme"), Some(json!("dark")));

    // Conflict, then a re-submission at the remote high-water mark
    let requests = harness.authority.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].cursor, 0);
    assert_eq!(requests[1].cursor, 950);
}

// ============================================================================
// Sibling instances
// ============================================================================

#[tokio::test(start_paused = true)]
async fn tabs_share_edits_over_live_channel() {
    let harness = Harness::new();
    let a = harness.tab("tab-a").spawn();
    let b = harness.tab("tab-b").spawn();
    a.barrier().await.unwrap();
    b.barrier().await.unwrap();

    a.record_change("theme", json!("dark")).await.unwrap();
    wait_for_value(&b, "theme", json!("dark")).await;

    assert_eq!(b.status().transport, TransportKind::Channel);
    // The edit is tab-a's to reconcile
    assert_eq!(b.status().pending, 0);
    assert_eq!(a.status().pending, 1);
}

#[tokio::test(start_paused = true)]
async fn tabs_share_edits_over_storage() {
    let harness = Harness::new();
    let config = SyncConfig {
        transport: TransportPreference::Storage,
        ..Harness::config()
    };
    let a = harness.tab("tab-a").config(config.clone()).spawn();
    let b = harness.tab("tab-b").config(config).spawn();
    a.barrier().await.unwrap();
    b.barrier().await.unwrap();

    b.record_change("language", json!("ja")).await.unwrap();
    wait_for_value(&a, "language", json!("ja")).await;

    assert_eq!(a.status().transport, TransportKind::Storage);
    assert_eq!(a.status().pending, 0);
}

#[tokio::test(start_paused = true)]
async fn sibling_merge_never_overwrites_newer_local_value() {
    let harness = Harness::new();
    let a = harness.tab("tab-a").spawn();
    let b = harness.tab("tab-b").spawn();
    a.barrier().await.unwrap();
    b.barrier().await.unwrap();

    a.record_change("theme", json!("light")).await.unwrap();
    wait_for_value(&b, "theme", json!("light")).await;

    harness.clock.advance(5);
    b.record_change("theme", json!("dark")).await.unwrap();
    wait_for_value(&a, "theme", json!("dark")).await;

    // tab-a's unsent "light" was superseded
    assert_eq!(a.status().pending, 0);
    assert_eq!(b.status().pending, 1);
}

#[tokio::test(start_paused = true)]
async fn authority_tie_decision_reaches_every_tab() {
    let harness = Harness::new();
    harness.authority.seed("language", json!("de"), 1_000);
    let a = harness.tab("tab-a").spawn();
    let b = harness.tab("tab-b").spawn();
    a.barrier().await.unwrap();
    b.barrier().await.unwrap();

    // Stamped 1000, the same as the authority's value
    let stamp = a.record_change("language", json!("fr")).await.unwrap();
    assert_eq!(stamp, 1_000);
    wait_for_value(&b, "language", json!("fr")).await;

    // The authority keeps "de"; tab-b only learns that from tab-a
    reconciled(&a).await;
    assert_eq!(a.get_field("language"), Some(json!("de")));
    wait_for_value(&b, "language", json!("de")).await;

    assert!(a.snapshot().same_values(&b.snapshot()));
    assert_eq!(harness.authority.value("language"), Some(json!("de")));
}

// ============================================================================
// Durable state
// ============================================================================

#[tokio::test(start_paused = true)]
async fn unreadable_durable_state_falls_back_to_defaults() {
    let harness = Harness::new();
    harness
        .storage
        .set("old-build", "settings.document", b"{\"formatVersion\":".to_vec())
        .unwrap();
    harness
        .storage
        .set("old-build", "settings.pending", b"\x00\x01 not a backup".to_vec())
        .unwrap();

    let tab = harness.tab("tab-a").spawn();
    tab.barrier().await.unwrap();

    let schema = Schema::finance();
    for (field, default) in schema.defaults() {
        assert_eq!(tab.get_field(field), Some(default.clone()));
    }
    assert_eq!(tab.status().pending, 0);

    // The instance works normally from there
    tab.record_change("currency", json!("CHF")).await.unwrap();
    reconciled(&tab).await;
    assert_eq!(harness.authority.value("currency"), Some(json!("CHF")));

    // Both records were rewritten readable
    let bytes = harness.storage.get("settings.document").unwrap().unwrap();
    let persisted = tally_engine::PersistedDocument::from_bytes(&bytes).unwrap();
    assert_eq!(persisted.document.get("currency"), Some(&json!("CHF")));
    assert!(backup(&harness).is_empty());
}

#[tokio::test(start_paused = true)]
async fn superseded_backup_entries_are_released() {
    let harness = Harness::new();
    harness.authority.seed("theme", json!("light"), 900);

    // Left behind by an earlier run: older than what the authority holds
    let mut stale = OfflineBackup::new();
    stale.absorb(
        &[("theme".to_string(), tally_engine::StampedValue::new(json!("dark"), 500))].into(),
    );
    harness
        .storage
        .set("old-build", "settings.pending", stale.to_bytes().unwrap())
        .unwrap();

    let tab = harness
        .tab("tab-a")
        .config(SyncConfig {
            sync_on_start: true,
            ..Harness::config()
        })
        .spawn();

    wait_for_value(&tab, "theme", json!("light")).await;
    wait_for_status(&tab, |s| !s.syncing && s.last_reconciled > 0).await;

    assert!(backup(&harness).is_empty());
    // Nothing stale was sent
    assert!(harness.authority.content_requests().is_empty());
}

#[tokio::test]
async fn processes_sharing_a_storage_directory_converge() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();

    // One storage handle per process, as the binary opens it
    let spawn = |id: &str| {
        let storage = FileStorage::open_shared(dir.path()).unwrap();
        storage.watch(Duration::from_millis(20));
        SyncBuilder::new(harness.authority.clone(), storage)
            .clock(harness.clock.clone())
            .instance_id(id)
            .config(Harness::config())
            .spawn()
    };
    let a = spawn("proc-a");
    let b = spawn("proc-b");

    a.record_change("theme", json!("dark")).await.unwrap();
    wait_for_value(&b, "theme", json!("dark")).await;

    b.record_change("currency", json!("SEK")).await.unwrap();
    wait_for_value(&a, "currency", json!("SEK")).await;

    assert_eq!(b.status().transport, TransportKind::Storage);
    assert!(a.snapshot().same_values(&b.snapshot()));
}
