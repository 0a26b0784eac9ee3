//! Chunked upload into a service blob.

use plc_runtime::blob::content_id;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::debug;

use crate::connector::Connector;
use crate::error::ConnectorError;

/// Default chunk size.
pub const CHUNK_SIZE: usize = 1 << 20;

const SEED_BYTES: usize = 16;

/// Upload `data` under a fresh random seed and return the blob id.
///
/// The id the service reports after the last chunk must equal the digest
/// computed locally; anything else means the transfer was corrupted.
pub fn upload_blob(
    connector: &Connector,
    data: &[u8],
    chunk_size: usize,
) -> Result<String, ConnectorError> {
    let mut seed = [0u8; SEED_BYTES];
    OsRng.fill_bytes(&mut seed);
    upload_with_seed(connector, &seed, data, chunk_size)
}

pub fn upload_with_seed(
    connector: &Connector,
    seed: &[u8],
    data: &[u8],
    chunk_size: usize,
) -> Result<String, ConnectorError> {
    let expected = content_id(seed, data);
    let mut blob_id = connector.seed_blob(seed)?;
    for chunk in data.chunks(chunk_size.max(1)) {
        blob_id = connector.append_chunk_to_blob(chunk, &blob_id)?;
    }
    if blob_id != expected {
        return Err(ConnectorError::Upload(
            format!("blob id {blob_id} does not match local digest {expected}").into(),
        ));
    }
    debug!(bytes = data.len(), blob = %blob_id, "upload complete");
    Ok(blob_id)
}
