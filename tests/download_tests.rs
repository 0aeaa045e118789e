mod common;

use common::*;
use lancast::common::ServerConfig;
use lancast::receive::{ReceiveOptions, Receiver, STDOUT_SENTINEL};
use tokio::io::AsyncReadExt;

#[tokio::test]
async fn small_file_round_trip() {
    let dir = setup_temp_dir();
    let data = vec![b'a'; 1024];
    let source = write_file(dir.path(), "payload.bin", &data);

    let (instance, base) = start_server(ServerConfig::send_file(source)).await;
    let url = download_url(&base, instance.token());

    let out_dir = setup_temp_dir();
    let mut opts = ReceiveOptions::new(&url);
    opts.output = Some(out_dir.path().join("payload.bin"));

    let outcome = Receiver::new().download(opts).await.unwrap();
    assert_eq!(outcome.bytes, 1024);
    assert_eq!(outcome.sha256.as_deref(), Some(sha256_hex(&data).as_str()));

    let received = std::fs::read(out_dir.path().join("payload.bin")).unwrap();
    assert_eq!(received, data);

    instance.shutdown().await;
}

#[tokio::test]
async fn download_announces_disposition_and_checksum() {
    let dir = setup_temp_dir();
    let data = b"some binary payload".to_vec();
    let source = write_file(dir.path(), "report.pdf", &data);

    let (instance, base) = start_server(ServerConfig::send_file(source)).await;

    let response = reqwest::get(download_url(&base, instance.token()))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("content-disposition")
            .unwrap()
            .to_str()
            .unwrap(),
        "attachment; filename=\"report.pdf\""
    );
    assert_eq!(
        response
            .headers()
            .get("x-content-sha256")
            .unwrap()
            .to_str()
            .unwrap(),
        sha256_hex(&data)
    );
    assert_eq!(response.bytes().await.unwrap().to_vec(), data);

    instance.shutdown().await;
}

#[tokio::test]
async fn text_is_served_inline_and_hits_stdout() {
    let (instance, base) = start_server(ServerConfig::send_text("hello".into())).await;
    let url = download_url(&base, instance.token());

    let response = reqwest::get(&url).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap(),
        "text/plain; charset=utf-8"
    );
    assert_eq!(
        response
            .headers()
            .get("content-length")
            .unwrap()
            .to_str()
            .unwrap(),
        "5"
    );
    assert!(response.headers().get("content-disposition").is_none());
    assert_eq!(response.text().await.unwrap(), "hello");

    // The receiver treats undisposed text as a stdout stream
    let outcome = Receiver::new()
        .download(ReceiveOptions::new(&url))
        .await
        .unwrap();
    assert_eq!(outcome.path, STDOUT_SENTINEL);
    assert_eq!(outcome.bytes, 5);

    instance.shutdown().await;
}

#[tokio::test]
async fn mismatched_token_is_forbidden_for_every_route() {
    let (instance, base) = start_server(ServerConfig::send_text("x".into())).await;
    let token = instance.token();

    // Suffixed, truncated, and unrelated tokens all bounce
    for bad in [
        format!("{}!", token),
        token[..63].to_string(),
        "0".repeat(64),
    ] {
        let response = reqwest::get(download_url(&base, &bad)).await.unwrap();
        assert_eq!(response.status(), 403, "token {:?}", bad);
    }

    instance.shutdown().await;
}

#[tokio::test]
async fn range_resume_completes_the_file() {
    let dir = setup_temp_dir();
    let data: Vec<u8> = b"ABCDEFGHIJ".repeat(1024 * 1024); // 10 MB
    let source = write_file(dir.path(), "big.bin", &data);

    let (instance, base) = start_server(ServerConfig::send_file(source)).await;
    let url = download_url(&base, instance.token());

    // Simulate an aborted first attempt: half the file is already on disk
    let out_dir = setup_temp_dir();
    let output = out_dir.path().join("big.bin");
    std::fs::write(&output, &data[..5 * 1024 * 1024]).unwrap();

    let mut opts = ReceiveOptions::new(&url);
    opts.output = Some(output.clone());

    let outcome = Receiver::new().download(opts).await.unwrap();
    assert_eq!(outcome.bytes, data.len() as u64);
    assert_eq!(outcome.sha256.unwrap(), sha256_hex(&data));
    assert_eq!(std::fs::read(&output).unwrap(), data);

    instance.shutdown().await;
}

#[tokio::test]
async fn range_request_gets_partial_content() {
    let dir = setup_temp_dir();
    let data: Vec<u8> = (0..=255u8).collect::<Vec<_>>().repeat(16); // 4096 bytes
    let source = write_file(dir.path(), "ranged.bin", &data);

    let (instance, base) = start_server(ServerConfig::send_file(source)).await;

    let client = reqwest::Client::new();
    let response = client
        .get(download_url(&base, instance.token()))
        .header("range", "bytes=4000-")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 206);
    assert_eq!(
        response
            .headers()
            .get("content-range")
            .unwrap()
            .to_str()
            .unwrap(),
        "bytes 4000-4095/4096"
    );
    assert_eq!(
        response
            .headers()
            .get("content-length")
            .unwrap()
            .to_str()
            .unwrap(),
        "96"
    );
    assert_eq!(response.bytes().await.unwrap().to_vec(), &data[4000..]);

    instance.shutdown().await;
}

#[tokio::test]
async fn compression_negotiation_prefers_zstd() {
    let dir = setup_temp_dir();
    let data = "the quick brown fox\n".repeat(205); // 4100 bytes, > 1 KB
    let source = write_file(dir.path(), "words.txt", data.as_bytes());

    let (instance, base) = start_server(ServerConfig::send_file(source)).await;

    let client = reqwest::Client::new();
    let response = client
        .get(download_url(&base, instance.token()))
        .header("accept-encoding", "gzip, zstd")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("content-encoding")
            .unwrap()
            .to_str()
            .unwrap(),
        "zstd"
    );
    assert_eq!(
        response
            .headers()
            .get("x-content-sha256")
            .unwrap()
            .to_str()
            .unwrap(),
        sha256_hex(data.as_bytes())
    );

    let compressed = response.bytes().await.unwrap();
    let mut decoder =
        async_compression::tokio::bufread::ZstdDecoder::new(compressed.as_ref());
    let mut decoded = Vec::new();
    decoder.read_to_end(&mut decoded).await.unwrap();
    assert_eq!(decoded, data.as_bytes());

    instance.shutdown().await;
}

#[tokio::test]
async fn small_text_files_skip_compression() {
    let dir = setup_temp_dir();
    let source = write_file(dir.path(), "tiny.txt", b"under a kilobyte");

    let (instance, base) = start_server(ServerConfig::send_file(source)).await;

    let client = reqwest::Client::new();
    let response = client
        .get(download_url(&base, instance.token()))
        .header("accept-encoding", "zstd")
        .send()
        .await
        .unwrap();

    assert!(response.headers().get("content-encoding").is_none());
    assert_eq!(response.bytes().await.unwrap().to_vec(), b"under a kilobyte");

    instance.shutdown().await;
}

#[tokio::test]
async fn directory_is_served_as_zip() {
    let dir = setup_temp_dir();
    let shared = dir.path().join("shared");
    std::fs::create_dir(&shared).unwrap();
    std::fs::write(shared.join("a.txt"), b"alpha").unwrap();
    std::fs::create_dir(shared.join("sub")).unwrap();
    std::fs::write(shared.join("sub/b.txt"), b"beta").unwrap();

    let (instance, base) = start_server(ServerConfig::send_file(shared)).await;

    let response = reqwest::get(download_url(&base, instance.token()))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap(),
        "application/zip"
    );
    assert_eq!(
        response
            .headers()
            .get("content-disposition")
            .unwrap()
            .to_str()
            .unwrap(),
        "attachment; filename=\"shared.zip\""
    );

    let bytes = response.bytes().await.unwrap().to_vec();
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
    let mut names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect();
    names.sort();
    assert_eq!(names, ["a.txt", "sub/b.txt"]);

    instance.shutdown().await;
}

#[tokio::test]
async fn missing_source_is_not_found() {
    let dir = setup_temp_dir();
    let source = write_file(dir.path(), "gone.bin", b"soon deleted");

    let (instance, base) = start_server(ServerConfig::send_file(source.clone())).await;
    std::fs::remove_file(&source).unwrap();

    let response = reqwest::get(download_url(&base, instance.token()))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    instance.shutdown().await;
}

#[tokio::test]
async fn health_and_metrics_respond() {
    let (instance, base) = start_server(ServerConfig::send_text("x".into())).await;

    let health: serde_json::Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    // Trip a counter, then read it back
    let _ = reqwest::get(download_url(&base, instance.token())).await.unwrap();
    let metrics = reqwest::get(format!("{}/metrics", base))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("download_requests_total 1"), "{}", metrics);

    instance.shutdown().await;
}
