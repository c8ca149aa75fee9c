//! HTTP-JSON log shipping handler.
//!
//! Ported from `domovoy/core/logging/http_json.py`'s session+retry pattern: a
//! dedicated thread owns a blocking client and POSTs one record per request,
//! so a slow or unreachable sink never blocks the calling log site.

use std::sync::mpsc::{sync_channel, SyncSender, TrySendError};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::Level;
use serde::Serialize;

const CHANNEL_CAPACITY: usize = 1024;
const THROTTLE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Serialize)]
struct Payload {
    logger_name: String,
    level: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    app_name: Option<String>,
}

pub struct HttpJsonHandler {
    tx: SyncSender<Payload>,
}

impl HttpJsonHandler {
    pub fn new(url: String, username: String, password: String) -> Self {
        let (tx, rx) = sync_channel::<Payload>(CHANNEL_CAPACITY);

        std::thread::Builder::new()
            .name("log-http-json".to_string())
            .spawn(move || {
                let client = reqwest::blocking::Client::builder()
                    .timeout(Duration::from_secs(5))
                    .build()
                    .expect("http client construction must not fail");

                for payload in rx {
                    let mut attempt = 0u32;
                    loop {
                        let result = client
                            .post(&url)
                            .basic_auth(&username, Some(&password))
                            .json(&payload)
                            .send();

                        match result {
                            Ok(resp) if resp.status().is_success() => break,
                            _ if attempt >= 3 => break,
                            _ => {
                                attempt += 1;
                                std::thread::sleep(Duration::from_millis(250 * attempt as u64));
                            }
                        }
                    }
                }
            })
            .expect("failed to spawn log shipping thread");

        Self { tx }
    }

    pub fn submit(&self, level: Level, logger_name: &str, app_name: Option<&str>, message: &str) {
        let payload = Payload {
            logger_name: logger_name.to_string(),
            level: level.to_string(),
            message: message.to_string(),
            app_name: app_name.map(str::to_string),
        };

        if let Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) = self.tx.try_send(payload) {
            note_dropped_send();
        }
    }
}

static LAST_DROP_WARNING: Mutex<Option<Instant>> = Mutex::new(None);

fn note_dropped_send() {
    let mut guard = LAST_DROP_WARNING.lock().expect("lock poisoned");
    let now = Instant::now();
    let should_warn = guard.map(|last| now.duration_since(last) >= THROTTLE_WINDOW).unwrap_or(true);
    if should_warn {
        *guard = Some(now);
        eprintln!("log-http-json: dropping records, sink is falling behind or unreachable");
    }
}
