// Chunk Padding — variable chunk sizes with random padding
//
// Splits outbound data into chunks whose sizes follow either a uniform
// range or an inverse-CDF sampler fitted to a reference size histogram.
// Neither chunk sizes nor framed lengths are ever powers of two.

use super::ShapingError;
use crate::rng::RngHandle;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Frame header: data_len (2) + pad_len (2)
pub const CHUNK_HEADER_SIZE: usize = 4;

/// Chunk sizing and padding parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaddingConfig {
    /// Smallest data chunk (bytes)
    pub min_chunk: usize,
    /// Largest data chunk (bytes)
    pub max_chunk: usize,
    /// Smallest random padding per chunk (bytes)
    pub min_padding: usize,
    /// Largest random padding per chunk (bytes)
    pub max_padding: usize,
    /// Draw sizes from the HTTPS-like baseline when no histogram is given
    pub match_baseline: bool,
    /// Bins used when fitting the baseline
    pub histogram_bins: usize,
    /// Reference histogram for inverse-CDF sampling
    pub size_histogram: Option<SizeHistogram>,
}

impl Default for PaddingConfig {
    fn default() -> Self {
        Self {
            min_chunk: 300,
            max_chunk: 1600,
            min_padding: 10,
            max_padding: 60,
            match_baseline: false,
            histogram_bins: 64,
            size_histogram: None,
        }
    }
}

impl PaddingConfig {
    pub fn validate(&self) -> Result<(), ShapingError> {
        if self.min_chunk == 0 || self.min_chunk > self.max_chunk {
            return Err(ShapingError::InvalidConfig(
                "chunk range must satisfy 0 < min_chunk <= max_chunk".to_string(),
            ));
        }
        if self.min_padding > self.max_padding {
            return Err(ShapingError::InvalidConfig(
                "min_padding must not exceed max_padding".to_string(),
            ));
        }
        if self.max_chunk + self.max_padding + 1 > u16::MAX as usize {
            return Err(ShapingError::InvalidConfig(
                "chunk plus padding exceeds frame limit".to_string(),
            ));
        }
        if self.histogram_bins == 0 {
            return Err(ShapingError::InvalidConfig(
                "histogram_bins must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Histogram with cumulative distribution for inverse-CDF sampling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeHistogram {
    /// Monotone bin edges, `bins + 1` entries
    pub edges: Vec<f64>,
    /// Cumulative probability at each edge, starting at 0 and ending at 1
    pub cdf: Vec<f64>,
}

impl SizeHistogram {
    /// Fit an equal-width histogram to observed sizes
    pub fn fit(samples: &[usize], bins: usize) -> Result<Self, ShapingError> {
        if samples.is_empty() || bins == 0 {
            return Err(ShapingError::InvalidConfig(
                "histogram needs samples and at least one bin".to_string(),
            ));
        }
        let lo = samples.iter().copied().min().unwrap_or(0) as f64;
        let hi = samples.iter().copied().max().unwrap_or(0) as f64;
        let hi = if hi > lo { hi } else { lo + 1.0 };
        let width = (hi - lo) / bins as f64;

        let mut counts = vec![0u64; bins];
        for &s in samples {
            let idx = (((s as f64 - lo) / width) as usize).min(bins - 1);
            counts[idx] += 1;
        }

        let total = samples.len() as f64;
        let edges = (0..=bins).map(|i| lo + width * i as f64).collect();
        let mut cdf = Vec::with_capacity(bins + 1);
        cdf.push(0.0);
        let mut running = 0u64;
        for c in counts {
            running += c;
            cdf.push(running as f64 / total);
        }
        Ok(Self { edges, cdf })
    }

    /// Synthetic HTTPS-like reference: 70% GET-sized (800 ± 200),
    /// 30% POST-sized (1200 ± 300), clamped to 100..=2000
    pub fn https_baseline(rng: &mut RngHandle, samples: usize, bins: usize) -> Result<Self, ShapingError> {
        let sizes: Vec<usize> = (0..samples.max(1))
            .map(|_| {
                let (mean, std) = if rng.u01() < 0.70 {
                    (800.0, 200.0)
                } else {
                    (1200.0, 300.0)
                };
                (mean + std * standard_normal(rng)).clamp(100.0, 2000.0) as usize
            })
            .collect();
        Self::fit(&sizes, bins)
    }

    /// Inverse-CDF draw, linearly interpolated within the bin
    pub fn sample(&self, rng: &mut RngHandle) -> f64 {
        if self.edges.len() < 2 || self.cdf.len() != self.edges.len() {
            return self.edges.first().copied().unwrap_or(0.0);
        }
        let u = rng.u01();
        let i = self
            .cdf
            .partition_point(|c| *c < u)
            .clamp(1, self.edges.len() - 1);
        let (a, b) = (self.edges[i - 1], self.edges[i]);
        let span = (self.cdf[i] - self.cdf[i - 1]).max(1e-9);
        a + (b - a) * ((u - self.cdf[i - 1]) / span).clamp(0.0, 1.0)
    }
}

fn standard_normal(rng: &mut RngHandle) -> f64 {
    let u1 = rng.u01();
    let u2 = rng.u01();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Move a size off a power of two, staying inside [lo, hi] where possible
pub fn avoid_power_of_two(size: usize, lo: usize, hi: usize) -> usize {
    if !size.is_power_of_two() {
        return size;
    }
    if size < hi {
        size + 1
    } else if size > lo.max(3) {
        size - 1
    } else {
        size + 1
    }
}

/// Splits data into padded frames
#[derive(Debug, Clone)]
pub struct Chunker {
    config: PaddingConfig,
    histogram: Option<SizeHistogram>,
}

impl Chunker {
    pub fn new(config: PaddingConfig, rng: &mut RngHandle) -> Result<Self, ShapingError> {
        config.validate()?;
        let histogram = match (&config.size_histogram, config.match_baseline) {
            (Some(h), _) => Some(h.clone()),
            (None, true) => Some(SizeHistogram::https_baseline(
                rng,
                1000,
                config.histogram_bins,
            )?),
            (None, false) => None,
        };
        Ok(Self { config, histogram })
    }

    pub fn config(&self) -> &PaddingConfig {
        &self.config
    }

    /// Next data chunk size
    pub fn chunk_size(&self, rng: &mut RngHandle) -> usize {
        let (lo, hi) = (self.config.min_chunk, self.config.max_chunk);
        let raw = match &self.histogram {
            Some(h) => (h.sample(rng).round() as usize).clamp(lo, hi),
            None => rng.range_inclusive(lo, hi),
        };
        avoid_power_of_two(raw, lo, hi)
    }

    fn padding(&self, rng: &mut RngHandle) -> usize {
        rng.range_inclusive(self.config.min_padding, self.config.max_padding)
    }

    /// Frame all of `data`; empty input yields no frames
    pub fn chunk(&self, data: &[u8], rng: &mut RngHandle) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            let take = self.chunk_size(rng).min(data.len() - pos);
            let pad = self.padding(rng);
            frames.push(frame(&data[pos..pos + take], pad, rng));
            pos += take;
        }
        frames
    }

    /// A cover frame drawn from the same size distribution as real frames
    pub fn cover_chunk(&self, rng: &mut RngHandle) -> Vec<u8> {
        let pad = self.chunk_size(rng) + self.padding(rng);
        frame(&[], pad, rng)
    }
}

/// `[data_len:u16][pad_len:u16][data][random pad]`, never a power-of-two length
fn frame(data: &[u8], pad: usize, rng: &mut RngHandle) -> Vec<u8> {
    let mut pad = pad;
    if (CHUNK_HEADER_SIZE + data.len() + pad).is_power_of_two() {
        pad += 1;
    }
    let mut out = Vec::with_capacity(CHUNK_HEADER_SIZE + data.len() + pad);
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(&(pad as u16).to_be_bytes());
    out.extend_from_slice(data);
    let start = out.len();
    out.resize(start + pad, 0);
    rng.fill_bytes(&mut out[start..]);
    out
}

/// Rebuilds the application byte stream from received frames
///
/// Frames may arrive split across cells; cover frames are dropped.
#[derive(Debug, Default)]
pub struct ChunkReassembler {
    buffer: Vec<u8>,
    cover_dropped: u64,
}

impl ChunkReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cover_dropped(&self) -> u64 {
        self.cover_dropped
    }

    /// Bytes buffered towards an incomplete frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Feed received bytes; returns the data of every completed real frame
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        let mut offset = 0;

        while self.buffer.len() - offset >= CHUNK_HEADER_SIZE {
            let head = &self.buffer[offset..];
            let data_len = u16::from_be_bytes([head[0], head[1]]) as usize;
            let pad_len = u16::from_be_bytes([head[2], head[3]]) as usize;
            let total = CHUNK_HEADER_SIZE + data_len + pad_len;
            if head.len() < total {
                break;
            }
            if data_len == 0 {
                self.cover_dropped += 1;
            } else {
                out.push(head[CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + data_len].to_vec());
            }
            offset += total;
        }

        self.buffer.drain(..offset);
        out
    }
}
