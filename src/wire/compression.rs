// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Pluggable payload compressors registered by numeric tag (§4.1, §6). The
//! registry is a process-wide map guarded by a read-write lock: init order
//! does not matter because registration only ever mutates the map and
//! lookup is pure (see DESIGN.md, "Global registries").

use std::{collections::HashMap, io::Read, sync::RwLock};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;

use crate::wire::message::CompressionTag;

pub trait Codec: Send + Sync {
    fn tag(&self) -> CompressionTag;
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;
    /// Decompression errors cause the payload to be dropped by the caller
    /// (§6); this just surfaces the error, it does not decide the fallout.
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

struct NoneCodec;

impl Codec for NoneCodec {
    fn tag(&self) -> CompressionTag {
        CompressionTag::None
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

struct GzipCodec;

impl Codec for GzipCodec {
    fn tag(&self) -> CompressionTag {
        CompressionTag::Gzip
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        use std::io::Write;

        use flate2::{Compression, write::GzEncoder};
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).context("gzip compress write")?;
        enc.finish().context("gzip compress finish")
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut dec = flate2::read::GzDecoder::new(data);
        let mut out = Vec::new();
        dec.read_to_end(&mut out).context("gzip decompress")?;
        Ok(out)
    }
}

struct SnappyCodec;

impl Codec for SnappyCodec {
    fn tag(&self) -> CompressionTag {
        CompressionTag::Snappy
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(snap::raw::Encoder::new()
            .compress_vec(data)
            .context("snappy compress")?)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(snap::raw::Decoder::new()
            .decompress_vec(data)
            .context("snappy decompress")?)
    }
}

struct ZstdCodec;

impl Codec for ZstdCodec {
    fn tag(&self) -> CompressionTag {
        CompressionTag::Zstd
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::stream::encode_all(data, 0).context("zstd compress")
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::stream::decode_all(data).context("zstd decompress")
    }
}

static NONE_CODEC: NoneCodec = NoneCodec;
static GZIP_CODEC: GzipCodec = GzipCodec;
static SNAPPY_CODEC: SnappyCodec = SnappyCodec;
static ZSTD_CODEC: ZstdCodec = ZstdCodec;

static REGISTRY: Lazy<RwLock<HashMap<u8, &'static (dyn Codec)>>> = Lazy::new(|| {
    let mut m: HashMap<u8, &'static (dyn Codec)> = HashMap::new();
    m.insert(CompressionTag::None as u8, &NONE_CODEC);
    m.insert(CompressionTag::Gzip as u8, &GZIP_CODEC);
    m.insert(CompressionTag::Snappy as u8, &SNAPPY_CODEC);
    m.insert(CompressionTag::Zstd as u8, &ZSTD_CODEC);
    RwLock::new(m)
});

/// Registers (or replaces) the codec for a tag, the way `resolver::
/// register_scheme` registers a scheme builder.
pub fn register_codec(tag: CompressionTag, codec: &'static dyn Codec) {
    REGISTRY
        .write()
        .expect("compression registry lock poisoned")
        .insert(tag as u8, codec);
}

/// Looks up the codec for a tag. `None` is always registered and is a
/// passthrough (§6).
pub fn lookup(tag: CompressionTag) -> Option<&'static dyn Codec> {
    REGISTRY
        .read()
        .expect("compression registry lock poisoned")
        .get(&(tag as u8))
        .copied()
}
