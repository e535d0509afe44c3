use super::*;

fn sample_session() -> PersistedSession {
    PersistedSession {
        base_url: "https://wx.example.com/cgi-bin/mmwebwx-bin".into(),
        sid: "sid-1".into(),
        skey: "@crypt_skey".into(),
        uin: 12345,
        device_id: "e999471493880231".into(),
        pass_ticket: "ticket".into(),
        cookies: vec![StoredCookie {
            name: "wxuin".into(),
            value: "12345".into(),
        }],
    }
}

#[tokio::test]
async fn round_trips_a_session_blob() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FileSessionStore::new(dir.path());

    let session = sample_session();
    store.save(&session).await.expect("save");

    let loaded = store.load().await.expect("load").expect("present");
    assert_eq!(loaded, session);
}

#[tokio::test]
async fn missing_blob_loads_as_none() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FileSessionStore::new(dir.path().join("never-created"));
    assert!(store.load().await.expect("load").is_none());
}

#[tokio::test]
async fn corrupt_blob_is_a_load_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FileSessionStore::new(dir.path());
    tokio::fs::write(dir.path().join("session.json"), b"{not json")
        .await
        .expect("write");

    assert!(store.load().await.is_err());
}

#[tokio::test]
async fn clear_removes_the_blob_and_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FileSessionStore::new(dir.path());
    store.save(&sample_session()).await.expect("save");

    store.clear().await.expect("clear");
    assert!(store.load().await.expect("load").is_none());
    store.clear().await.expect("clear again");
}

#[tokio::test]
async fn save_creates_the_storage_root() {
    let dir = tempfile::tempdir().expect("tempdir");
    let nested = dir.path().join("a").join("b");
    let store = FileSessionStore::new(&nested);

    store.save(&sample_session()).await.expect("save");
    assert!(nested.join("session.json").exists());
}

#[test]
fn completeness_requires_every_credential_field() {
    let full = sample_session();
    assert!(full.is_complete());

    let mut missing_skey = full.clone();
    missing_skey.skey.clear();
    assert!(!missing_skey.is_complete());

    let mut missing_uin = full.clone();
    missing_uin.uin = 0;
    assert!(!missing_uin.is_complete());

    let mut missing_cookies = full.clone();
    missing_cookies.cookies.clear();
    assert!(!missing_cookies.is_complete());

    let mut missing_ticket = full;
    missing_ticket.pass_ticket.clear();
    assert!(!missing_ticket.is_complete());
}

#[tokio::test]
async fn memory_store_round_trips() {
    let store = MemorySessionStore::new();
    assert!(store.load().await.expect("load").is_none());

    store.save(&sample_session()).await.expect("save");
    assert_eq!(
        store.load().await.expect("load"),
        Some(sample_session())
    );

    store.clear().await.expect("clear");
    assert!(store.load().await.expect("load").is_none());
}
