//! bifrost-echo-worker — reference worker for bifrost.
//!
//! Speaks the worker frame protocol on stdin/stdout and echoes every
//! request payload back. A few method names trigger special behavior,
//! which the bridge's own tests rely on:
//!
//! | method   | reply                                                  |
//! |----------|--------------------------------------------------------|
//! | `Crash`  | exits with status 1 without replying                   |
//! | `Fail`   | error `INVALID_ARGUMENT` (3)                           |
//! | `Env`    | value of the environment variable named by the payload |
//! | `Sleep`  | sleeps for the payload's decimal milliseconds, echoes  |
//! | `Meta`   | the request metadata as JSON                           |

use std::time::Duration;

use bifrost::worker::frame::{self, RequestHeader, ResponseHeader, WorkerFault};
use bytes::Bytes;
use tokio::io::{BufReader, BufWriter};

const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::io::Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = BufWriter::new(tokio::io::stdout());

    while let Some((header, payload)) =
        frame::read_frame::<RequestHeader, _>(&mut stdin, MAX_FRAME_BYTES).await?
    {
        let method = header
            .method
            .rsplit_once('/')
            .map_or(header.method.as_str(), |(_, method)| method);

        let (reply, body) = match method {
            "Crash" => {
                eprintln!("crashing on request");
                std::process::exit(1);
            }
            "Fail" => (
                ResponseHeader {
                    error: Some(WorkerFault {
                        code: 3,
                        message: "requested failure".to_string(),
                    }),
                },
                Bytes::new(),
            ),
            "Env" => {
                let name = String::from_utf8_lossy(&payload);
                let value = std::env::var(name.as_ref()).unwrap_or_default();
                (ResponseHeader::default(), Bytes::from(value))
            }
            "Sleep" => {
                let millis = String::from_utf8_lossy(&payload).trim().parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(millis)).await;
                (ResponseHeader::default(), payload)
            }
            "Meta" => {
                let json = serde_json::to_vec(&header.metadata)?;
                (ResponseHeader::default(), Bytes::from(json))
            }
            _ => (ResponseHeader::default(), payload),
        };

        frame::write_frame(&mut stdout, &reply, &body).await?;
    }

    Ok(())
}
