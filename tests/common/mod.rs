#![allow(dead_code)]

use rusty_sheet_server::cache::{CacheStore, LatestTable, MemoryCache};
use rusty_sheet_server::config::ServiceConfig;
use rusty_sheet_server::http::{build_router, AppState};
use rusty_sheet_server::ingest::Ingestor;
use rusty_sheet_server::query::QueryEngine;
use rusty_sheet_server::store::Store;
use std::io::{BufRead, BufReader, Cursor, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::process::{Child, Command, Stdio};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const BOUNDARY: &str = "sheet-test-boundary";

pub struct ServerGuard {
    child: Child,
    _data_dir: tempfile::TempDir,
    stderr_thread: Option<thread::JoinHandle<()>>,
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Runs the server binary on an ephemeral port over a fresh data directory.
pub fn spawn_server() -> anyhow::Result<(ServerGuard, SocketAddr)> {
    let bin = env!("CARGO_BIN_EXE_rusty-sheet-server");
    let data_dir = tempfile::tempdir()?;

    let mut child = Command::new(bin)
        .args(["--listen", "127.0.0.1:0", "--data"])
        .arg(data_dir.path())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow::anyhow!("failed to capture server stderr"))?;

    let (addr_tx, addr_rx) = mpsc::channel::<SocketAddr>();
    let stderr_thread = thread::spawn(move || {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();
        while reader
            .read_line(&mut line)
            .ok()
            .filter(|n| *n > 0)
            .is_some()
        {
            if let Some(rest) = line.strip_prefix("rusty-sheet-server listening on ") {
                if let Ok(addr) = rest.trim().parse::<SocketAddr>() {
                    let _ = addr_tx.send(addr);
                }
            }
            eprint!("{}", line);
            line.clear();
        }
    });

    let addr = match addr_rx.recv_timeout(Duration::from_secs(5)) {
        Ok(addr) => addr,
        Err(err) => {
            if let Some(status) = child.try_wait()? {
                anyhow::bail!("server exited before reporting listen address: {status} ({err})");
            }
            anyhow::bail!("timed out waiting for server listen address: {err}");
        }
    };

    Ok((
        ServerGuard {
            child,
            _data_dir: data_dir,
            stderr_thread: Some(stderr_thread),
        },
        addr,
    ))
}

/// Sends one HTTP/1.1 request and returns the status code and body.
pub fn http_request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    content_type: Option<&str>,
    body: &[u8],
) -> anyhow::Result<(u16, String)> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut head = format!(
        "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\nContent-Length: {}\r\n",
        body.len()
    );
    if let Some(ct) = content_type {
        head.push_str(&format!("Content-Type: {ct}\r\n"));
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes())?;
    stream.write_all(body)?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw)?;
    let text = String::from_utf8_lossy(&raw);
    let (head, body) = text
        .split_once("\r\n\r\n")
        .ok_or_else(|| anyhow::anyhow!("malformed response"))?;
    let status = head
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("missing status line"))?
        .parse()?;
    Ok((status, body.to_string()))
}

/// In-process service over a temporary store and a memory cache.
pub struct TestService {
    pub store: Store,
    pub cache: Arc<MemoryCache>,
    pub config: ServiceConfig,
    _dir: tempfile::TempDir,
}

impl TestService {
    pub fn new() -> Self {
        Self::with_config(ServiceConfig::default())
    }

    pub fn with_config(config: ServiceConfig) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path()).expect("open store");
        Self {
            store,
            cache: Arc::new(MemoryCache::new()),
            config,
            _dir: dir,
        }
    }

    pub fn cache_store(&self) -> Arc<dyn CacheStore> {
        self.cache.clone()
    }

    pub fn pointer(&self) -> LatestTable {
        LatestTable::new(self.cache_store(), self.config.cache_ttl)
    }

    pub fn ingestor(&self) -> Ingestor {
        Ingestor::new(self.store.clone(), self.pointer())
    }

    pub fn engine(&self) -> QueryEngine {
        QueryEngine::new(
            self.store.clone(),
            self.cache_store(),
            self.config.cache_ttl,
            self.config.fallback_to_newest,
        )
    }

    pub fn router(&self) -> axum::Router {
        let state = AppState::new(self.store.clone(), self.cache_store(), &self.config);
        build_router(state, &self.config)
    }
}

/// Workbook whose first sheet holds `rows` as inline strings. Empty strings
/// leave the cell out.
pub fn xlsx(rows: &[&[&str]]) -> Vec<u8> {
    let mut sheet = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#,
    );
    for (r, row) in rows.iter().enumerate() {
        sheet.push_str(&format!(r#"<row r="{}">"#, r + 1));
        for (c, value) in row.iter().enumerate() {
            if value.is_empty() {
                continue;
            }
            let escaped = value
                .replace('&', "&amp;")
                .replace('<', "&lt;")
                .replace('>', "&gt;");
            sheet.push_str(&format!(
                r#"<c r="{}{}" t="inlineStr"><is><t>{escaped}</t></is></c>"#,
                (b'A' + c as u8) as char,
                r + 1
            ));
        }
        sheet.push_str("</row>");
    }
    sheet.push_str("</sheetData></worksheet>");
    xlsx_with_sheet(sheet)
}

/// Workbook whose only sheet is the given worksheet XML.
pub fn xlsx_with_sheet(sheet: String) -> Vec<u8> {
    let parts = [
        (
            "[Content_Types].xml",
            r#"<?xml version="1.0" encoding="UTF-8"?><Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"/>"#.to_string(),
        ),
        (
            "xl/workbook.xml",
            r#"<?xml version="1.0" encoding="UTF-8"?><workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="Data" sheetId="1" r:id="rId1"/></sheets></workbook>"#.to_string(),
        ),
        (
            "xl/_rels/workbook.xml.rels",
            r#"<?xml version="1.0" encoding="UTF-8"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/></Relationships>"#.to_string(),
        ),
        ("xl/worksheets/sheet1.xml", sheet),
    ];

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, body) in parts {
        writer.start_file(name, options).expect("start zip entry");
        writer.write_all(body.as_bytes()).expect("write zip entry");
    }
    writer.finish().expect("finish zip").into_inner()
}

/// `multipart/form-data` body carrying one file field.
pub fn multipart(field: &str, filename: &str, bytes: &[u8]) -> (String, Vec<u8>) {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    (format!("multipart/form-data; boundary={BOUNDARY}"), body)
}
