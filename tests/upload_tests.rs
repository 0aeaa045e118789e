mod common;

use common::*;
use lancast::common::ServerConfig;
use rand::RngCore;

const MB: usize = 1024 * 1024;

fn chunk_request(
    client: &reqwest::Client,
    url: &str,
    session: &str,
    filename: &str,
    total: usize,
    chunk_total: u32,
    chunk_id: u32,
    offset: usize,
    payload: Vec<u8>,
) -> reqwest::RequestBuilder {
    client
        .post(url)
        .header("content-type", "application/octet-stream")
        .header("x-upload-session", session)
        .header("x-file-name", filename)
        .header("x-upload-total", total)
        .header("x-chunk-total", chunk_total)
        .header("x-chunk-id", chunk_id)
        .header("x-upload-offset", offset)
        .header("x-chunk-checksum", sha256_hex(&payload))
        .body(payload)
}

#[tokio::test]
async fn parallel_chunks_reassemble_out_of_order() {
    let uploads = setup_temp_dir();
    let (instance, base) =
        start_server(ServerConfig::host(uploads.path().to_path_buf())).await;
    let url = upload_url(&base, instance.token());

    // 5 MB of pseudo-random bytes in 5 x 1 MB chunks
    let mut data = vec![0u8; 5 * MB];
    rand::thread_rng().fill_bytes(&mut data);

    let client = reqwest::Client::new();
    let mut final_complete = false;

    for chunk_id in [2u32, 0, 4, 1, 3] {
        let offset = chunk_id as usize * MB;
        let payload = data[offset..offset + MB].to_vec();
        let response = chunk_request(
            &client,
            &url,
            "scatter-session",
            "scatter.bin",
            data.len(),
            5,
            chunk_id,
            offset,
            payload,
        )
        .send()
        .await
        .unwrap();

        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["chunk_id"], chunk_id);
        assert_eq!(body["filename"], "scatter.bin");
        final_complete = body["complete"].as_bool().unwrap();
    }

    assert!(final_complete, "last chunk must report complete");
    let written = std::fs::read(uploads.path().join("scatter.bin")).unwrap();
    assert_eq!(sha256_hex(&written), sha256_hex(&data));

    instance.shutdown().await;
}

#[tokio::test]
async fn concurrent_workers_complete_a_session() {
    let uploads = setup_temp_dir();
    let (instance, base) =
        start_server(ServerConfig::host(uploads.path().to_path_buf())).await;
    let url = upload_url(&base, instance.token());

    let mut data = vec![0u8; 3 * MB];
    rand::thread_rng().fill_bytes(&mut data);
    let data = std::sync::Arc::new(data);

    let client = reqwest::Client::new();
    let mut handles = Vec::new();
    for chunk_id in 0..3u32 {
        let client = client.clone();
        let url = url.clone();
        let data = data.clone();
        handles.push(tokio::spawn(async move {
            let offset = chunk_id as usize * MB;
            let payload = data[offset..offset + MB].to_vec();
            let response = chunk_request(
                &client,
                &url,
                "threaded-session",
                "threaded.bin",
                data.len(),
                3,
                chunk_id,
                offset,
                payload,
            )
            .send()
            .await
            .unwrap();
            assert_eq!(response.status(), 200);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let written = std::fs::read(uploads.path().join("threaded.bin")).unwrap();
    assert_eq!(sha256_hex(&written), sha256_hex(&data));

    instance.shutdown().await;
}

#[tokio::test]
async fn duplicate_chunk_replays_are_idempotent() {
    let uploads = setup_temp_dir();
    let (instance, base) =
        start_server(ServerConfig::host(uploads.path().to_path_buf())).await;
    let url = upload_url(&base, instance.token());

    let mut data = vec![0u8; 2 * MB];
    rand::thread_rng().fill_bytes(&mut data);

    let client = reqwest::Client::new();
    for _ in 0..3 {
        let response = chunk_request(
            &client,
            &url,
            "replay-session",
            "replay.bin",
            data.len(),
            2,
            0,
            0,
            data[..MB].to_vec(),
        )
        .send()
        .await
        .unwrap();
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["received"], 1, "write-set stays at one entry");
    }

    let response = chunk_request(
        &client,
        &url,
        "replay-session",
        "replay.bin",
        data.len(),
        2,
        1,
        MB,
        data[MB..].to_vec(),
    )
    .send()
    .await
    .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["complete"], true);

    let written = std::fs::read(uploads.path().join("replay.bin")).unwrap();
    assert_eq!(sha256_hex(&written), sha256_hex(&data));

    instance.shutdown().await;
}

#[tokio::test]
async fn multipart_duplicate_names_get_suffixes() {
    let uploads = setup_temp_dir();
    let (instance, base) =
        start_server(ServerConfig::host(uploads.path().to_path_buf())).await;
    let url = upload_url(&base, instance.token());

    let client = reqwest::Client::new();
    for contents in ["c1", "c2", "c3"] {
        let part = reqwest::multipart::Part::text(contents.to_string())
            .file_name("duplicate.txt")
            .mime_str("text/plain")
            .unwrap();
        let form = reqwest::multipart::Form::new().part("file", part);
        let response = client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    assert_eq!(
        std::fs::read(uploads.path().join("duplicate.txt")).unwrap(),
        b"c1"
    );
    assert_eq!(
        std::fs::read(uploads.path().join("duplicate (1).txt")).unwrap(),
        b"c2"
    );
    assert_eq!(
        std::fs::read(uploads.path().join("duplicate (2).txt")).unwrap(),
        b"c3"
    );

    instance.shutdown().await;
}

#[tokio::test]
async fn raw_single_shot_upload() {
    let uploads = setup_temp_dir();
    let (instance, base) =
        start_server(ServerConfig::host(uploads.path().to_path_buf())).await;
    let url = upload_url(&base, instance.token());

    let data = b"one shot body".to_vec();
    let client = reqwest::Client::new();
    let response = client
        .post(&url)
        .header("x-file-name", "oneshot.bin")
        .body(data.clone())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["filename"], "oneshot.bin");
    assert_eq!(body["size"], data.len() as u64);
    assert_eq!(std::fs::read(uploads.path().join("oneshot.bin")).unwrap(), data);

    instance.shutdown().await;
}

#[tokio::test]
async fn legacy_offset_shape_is_refused() {
    let uploads = setup_temp_dir();
    let (instance, base) =
        start_server(ServerConfig::host(uploads.path().to_path_buf())).await;

    let client = reqwest::Client::new();
    let response = client
        .post(upload_url(&base, instance.token()))
        .header("x-file-name", "legacy.bin")
        .header("x-upload-offset", "0")
        .header("x-upload-total", "4")
        .body(b"abcd".to_vec())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 409);

    instance.shutdown().await;
}

#[tokio::test]
async fn bad_chunk_headers_are_rejected() {
    let uploads = setup_temp_dir();
    let (instance, base) =
        start_server(ServerConfig::host(uploads.path().to_path_buf())).await;
    let url = upload_url(&base, instance.token());
    let client = reqwest::Client::new();

    // Session id too short
    let response = chunk_request(&client, &url, "shortid", "a.bin", MB, 1, 0, 0, vec![0; 16])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Chunk id out of range
    let response = chunk_request(
        &client,
        &url,
        "valid-session-id",
        "a.bin",
        MB,
        2,
        2,
        0,
        vec![0; 16],
    )
    .send()
    .await
    .unwrap();
    assert_eq!(response.status(), 400);

    // Traversal in the filename
    let response = chunk_request(
        &client,
        &url,
        "valid-session-id",
        "..%2Fescape.bin",
        MB,
        1,
        0,
        0,
        vec![0; 16],
    )
    .send()
    .await
    .unwrap();
    assert_eq!(response.status(), 400);

    instance.shutdown().await;
}

#[tokio::test]
async fn upload_requires_the_token() {
    let uploads = setup_temp_dir();
    let (instance, base) =
        start_server(ServerConfig::host(uploads.path().to_path_buf())).await;

    let client = reqwest::Client::new();
    let response = client
        .post(upload_url(&base, &"0".repeat(64)))
        .header("x-file-name", "nope.bin")
        .body(b"data".to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    // Nothing may land on disk off a rejected token
    assert_eq!(std::fs::read_dir(uploads.path()).unwrap().count(), 0);

    instance.shutdown().await;
}

#[tokio::test]
async fn manifest_advertises_chunking_hints() {
    let uploads = setup_temp_dir();
    let (instance, base) =
        start_server(ServerConfig::host(uploads.path().to_path_buf())).await;

    let manifest: serde_json::Value = reqwest::get(format!(
        "{}/manifest",
        upload_url(&base, instance.token())
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();

    assert!(manifest["chunk_size"].as_u64().unwrap() >= 64 * 1024);
    assert!(manifest["max_concurrent"].as_u64().unwrap() >= 1);

    instance.shutdown().await;
}

#[tokio::test]
async fn drop_page_is_served() {
    let uploads = setup_temp_dir();
    let (instance, base) =
        start_server(ServerConfig::host(uploads.path().to_path_buf())).await;

    let response = reqwest::get(upload_url(&base, instance.token()))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let page = response.text().await.unwrap();
    assert!(page.contains("<form"));

    instance.shutdown().await;
}
