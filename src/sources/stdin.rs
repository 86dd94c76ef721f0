//! Stdin signal source
//!
//! Reads JSON-formatted custom-source readings from stdin, one per line:
//!
//! ```text
//! {"name":"speed","timestamp_ms":1700000000000,"value":88.5}
//! {"name":"camera.front","timestamp_ms":1700000000100,"value":"YWJj..."}
//! ```
//!
//! Each reading resolves through the current decoder dictionary snapshot;
//! names the dictionary does not carry are skipped (the cloud did not ask
//! for them). Oversized string/bytes payloads are parked in the raw data
//! buffer and travel as handles.

use crate::decoder::DictionaryPublisher;
use crate::pipeline::SignalProducer;
use crate::rawdata::RawDataBufferManager;
use crate::types::{SignalSample, SignalType, SignalValue};
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One JSON line from the simulator or a custom source bridge.
#[derive(Debug, Deserialize)]
struct JsonReading {
    name: String,
    timestamp_ms: u64,
    value: serde_json::Value,
}

/// Run the stdin source until EOF or cancellation.
pub async fn run_stdin_source(
    producer: SignalProducer,
    dictionary: Arc<DictionaryPublisher>,
    rawdata: Arc<RawDataBufferManager>,
    cancel: CancellationToken,
) {
    info!("Stdin signal source started — waiting for JSON readings");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Stdin closed (EOF) — source stopping");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Stdin read error — source stopping");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let reading: JsonReading = match serde_json::from_str(&line) {
            Ok(reading) => reading,
            Err(e) => {
                warn!(error = %e, "Unparseable reading skipped");
                continue;
            }
        };

        // Snapshot held only for this reading; a concurrent dictionary
        // publish applies from the next line on.
        let dict = dictionary.snapshot();
        let Some(signal_id) = dict.custom_signal(&reading.name) else {
            debug!(name = %reading.name, "Signal not in dictionary — skipped");
            continue;
        };
        let Some(signal_type) = dict.signal_type(signal_id) else {
            continue;
        };

        let Some(value) = decode_value(signal_id, signal_type, &reading.value, &rawdata) else {
            warn!(name = %reading.name, "Reading value does not fit declared type — skipped");
            continue;
        };

        let sample = SignalSample::new(signal_id, reading.timestamp_ms, value);
        if producer.push(sample).is_err() {
            info!("Pipeline closed — stdin source stopping");
            break;
        }
    }
    info!(dropped = producer.dropped(), "Stdin signal source stopped");
}

/// Coerce the JSON value into the manifest-declared type. Complex payloads
/// go through the raw data buffer; a failed store means no sample.
fn decode_value(
    signal_id: u32,
    signal_type: SignalType,
    value: &serde_json::Value,
    rawdata: &RawDataBufferManager,
) -> Option<SignalValue> {
    match signal_type {
        SignalType::Bool => value.as_bool().map(SignalValue::Bool),
        SignalType::Int8 => value.as_i64().and_then(|v| i8::try_from(v).ok()).map(SignalValue::I8),
        SignalType::Int16 => value.as_i64().and_then(|v| i16::try_from(v).ok()).map(SignalValue::I16),
        SignalType::Int32 => value.as_i64().and_then(|v| i32::try_from(v).ok()).map(SignalValue::I32),
        SignalType::Int64 => value.as_i64().map(SignalValue::I64),
        SignalType::Uint8 => value.as_u64().and_then(|v| u8::try_from(v).ok()).map(SignalValue::U8),
        SignalType::Uint16 => value.as_u64().and_then(|v| u16::try_from(v).ok()).map(SignalValue::U16),
        SignalType::Uint32 => value.as_u64().and_then(|v| u32::try_from(v).ok()).map(SignalValue::U32),
        SignalType::Uint64 => value.as_u64().map(SignalValue::U64),
        SignalType::Float32 => value.as_f64().map(|v| SignalValue::F32(v as f32)),
        SignalType::Float64 => value.as_f64().map(SignalValue::F64),
        SignalType::String | SignalType::Bytes => {
            let text = value.as_str()?;
            match rawdata.store(signal_id, text.as_bytes()) {
                Ok(handle) => Some(SignalValue::RawHandle(handle)),
                Err(e) => {
                    warn!(signal_id, error = %e, "Complex payload not admitted");
                    None
                }
            }
        }
    }
}
