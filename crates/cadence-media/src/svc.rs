//! Static bitrate split across SVC spatial and temporal layers.
//!
//! Given a codec description and a total target rate, [`allocate`] produces
//! the per-(spatial, temporal) bitrate table the pacer's stream weights are
//! derived from. The split is geometric with factor 0.55: each successive
//! spatial layer receives 55% of the previous one's share, surplus above a
//! layer's maximum carries down, and spatial layers are deactivated top-down
//! while any active layer would land under its minimum.
//!
//! The function is pure and idempotent; all outputs are integer bits per
//! second and never sum to more than the input.

use serde::Deserialize;
use thiserror::Error;
use tracing::trace;

/// Ratio between the rates of two adjacent layers in a geometric split.
pub const LAYER_RATE_SCALING_FACTOR: f64 = 0.55;

/// Per-spatial-layer rate bounds from the codec configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SpatialLayer {
    pub min_bitrate_bps: u64,
    pub max_bitrate_bps: u64,
}

/// Codec descriptor consumed by [`allocate`].
#[derive(Debug, Clone, Deserialize)]
pub struct SvcCodecConfig {
    /// Active spatial layers, base layer first. Must be non-empty.
    pub spatial_layers: Vec<SpatialLayer>,
    /// Temporal layers per spatial layer. Must be at least 1.
    pub temporal_layers: usize,
    /// Screenshare content uses the encoder's internal allocator; the
    /// static split collapses to the base layer.
    #[serde(default)]
    pub screenshare: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SvcConfigError {
    #[error("codec config has no spatial layers")]
    NoSpatialLayers,
    #[error("codec config has no temporal layers")]
    NoTemporalLayers,
    #[error("spatial layer {index} has min bitrate {min_bps} above max {max_bps}")]
    InvalidLayerBounds { index: usize, min_bps: u64, max_bps: u64 },
}

/// Bitrate table indexed `[spatial][temporal]`, in bits per second.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerRateAllocation {
    rates: Vec<Vec<u64>>,
}

impl LayerRateAllocation {
    /// Rate of one layer; zero for indices outside the table.
    pub fn get(&self, spatial: usize, temporal: usize) -> u64 {
        self.rates
            .get(spatial)
            .and_then(|layer| layer.get(temporal))
            .copied()
            .unwrap_or(0)
    }

    /// Sum across the temporal layers of one spatial layer.
    pub fn spatial_total(&self, spatial: usize) -> u64 {
        self.rates
            .get(spatial)
            .map(|layer| layer.iter().sum())
            .unwrap_or(0)
    }

    /// Sum over the whole table.
    pub fn total_bps(&self) -> u64 {
        self.rates.iter().flatten().sum()
    }

    pub fn num_spatial_layers(&self) -> usize {
        self.rates.len()
    }

    pub fn num_temporal_layers(&self) -> usize {
        self.rates.first().map(Vec::len).unwrap_or(0)
    }
}

/// Split `total_bps` across the configured layers.
///
/// `framerate_fps` is accepted for interface completeness and logged; the
/// static split itself is rate-only.
pub fn allocate(
    config: &SvcCodecConfig,
    total_bps: u64,
    framerate_fps: f64,
) -> Result<LayerRateAllocation, SvcConfigError> {
    validate(config)?;
    trace!(total_bps, framerate_fps, layers = config.spatial_layers.len(), "svc allocate");

    let num_spatial = config.spatial_layers.len();
    let num_temporal = config.temporal_layers;
    let mut rates = vec![vec![0u64; num_temporal]; num_spatial];

    if config.screenshare {
        // Screenshare rate decisions live in the encoder; everything is
        // reported against the base layer.
        rates[0][0] = total_bps;
        return Ok(LayerRateAllocation { rates });
    }

    let spatial_rates = split_spatial(&config.spatial_layers, total_bps);

    for (spatial_idx, &layer_total) in spatial_rates.iter().enumerate() {
        if layer_total == 0 {
            continue;
        }
        // Geometric shares come out largest-first; the highest temporal
        // index receives the largest share.
        let temporal_shares = split_geometric(layer_total, num_temporal);
        for (rank, &share) in temporal_shares.iter().enumerate() {
            rates[spatial_idx][num_temporal - 1 - rank] = share;
        }
    }

    Ok(LayerRateAllocation { rates })
}

fn validate(config: &SvcCodecConfig) -> Result<(), SvcConfigError> {
    if config.spatial_layers.is_empty() {
        return Err(SvcConfigError::NoSpatialLayers);
    }
    if config.temporal_layers == 0 {
        return Err(SvcConfigError::NoTemporalLayers);
    }
    for (index, layer) in config.spatial_layers.iter().enumerate() {
        if layer.min_bitrate_bps > layer.max_bitrate_bps {
            return Err(SvcConfigError::InvalidLayerBounds {
                index,
                min_bps: layer.min_bitrate_bps,
                max_bps: layer.max_bitrate_bps,
            });
        }
    }
    Ok(())
}

/// Split across spatial layers: geometric shares, max-clamp with surplus
/// carried to the next layer, then deactivate the top layer and retry while
/// any active layer sits under its minimum.
fn split_spatial(layers: &[SpatialLayer], total_bps: u64) -> Vec<u64> {
    let mut active = layers.len();
    loop {
        let mut shares = split_geometric(total_bps, active);

        let mut surplus = 0u64;
        for (share, layer) in shares.iter_mut().zip(layers) {
            *share += surplus;
            surplus = share.saturating_sub(layer.max_bitrate_bps);
            *share = (*share).min(layer.max_bitrate_bps);
        }
        // Surplus past the last active layer stays unallocated.

        let underfunded = shares
            .iter()
            .zip(layers)
            .any(|(share, layer)| *share < layer.min_bitrate_bps);
        if underfunded && active > 1 {
            active -= 1;
            continue;
        }

        shares.resize(layers.len(), 0);
        return shares;
    }
}

/// Geometric split of `total` into `n` shares with ratio
/// [`LAYER_RATE_SCALING_FACTOR`], largest share first. Shares sum exactly to
/// `total`: the first `n - 1` are rounded, the last takes the remainder.
fn split_geometric(total: u64, n: usize) -> Vec<u64> {
    debug_assert!(n > 0);
    let denominator: f64 = (0..n)
        .map(|i| LAYER_RATE_SCALING_FACTOR.powi(i as i32))
        .sum();

    let mut shares = Vec::with_capacity(n);
    let mut allocated = 0u64;
    for i in 0..n - 1 {
        let weight = LAYER_RATE_SCALING_FACTOR.powi(i as i32) / denominator;
        let share = ((total as f64 * weight).round() as u64).min(total - allocated);
        shares.push(share);
        allocated += share;
    }
    shares.push(total - allocated);
    shares
}
