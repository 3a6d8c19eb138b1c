//! CLI surface honored by the core.
//!
//! Field-for-field grounded on the original's `futatabi/flags.h`, with the
//! documented, validated struct shape of
//! `config/config.rs`'s `CaptureConfig`. The core treats flag *parsing*
//! as belonging to the launcher rather than the core ("flag/config
//! parsing" as an external collaborator); what lives here is the `Flags`
//! value the launcher hands the core, plus the `clap` derive that builds
//! one from `argv` for the `futatabi` binary itself.

use clap::Parser;
use std::collections::HashMap;

/// Parsed CLI flags, handed to [`crate::context::CoreContext::new`].
#[derive(Parser, Debug, Clone)]
#[command(name = "futatabi", about = "Multi-camera instant-replay server")]
pub struct Flags {
    /// Width shared by every ingested stream.
    #[arg(long, default_value_t = 1280)]
    pub width: u32,

    /// Height shared by every ingested stream.
    #[arg(long, default_value_t = 720)]
    pub height: u32,

    /// Output frame rate as `N` or `N/M` (e.g. `60000/1001` for 59.94).
    #[arg(long, default_value = "60000/1001", value_parser = parse_frame_rate)]
    pub frame_rate: FrameRate,

    /// Play back ingested frames slower than real time (for debugging).
    #[arg(long, default_value_t = false)]
    pub slow_down_input: bool,

    /// Interpolation quality, 0 (off) through 4 (highest). See
    /// [`crate::gpu::dis_flow::OPERATING_POINTS`].
    #[arg(long, default_value_t = 2)]
    pub interpolation_quality: u8,

    /// Root directory for the `frames/` subdirectory and the catalog.
    #[arg(long, default_value = ".")]
    pub working_directory: String,

    /// HTTP publisher listen port.
    #[arg(long, default_value_t = crate::constants::DEFAULT_HTTP_PORT)]
    pub http_port: u16,

    /// Tally-light webhook URL (external collaborator; stored, not
    /// interpreted by the core).
    #[arg(long, default_value = "")]
    pub tally_url: String,

    /// Seconds of padding added before a cue-in point.
    #[arg(long, default_value_t = 0.0)]
    pub cue_in_point_padding: f64,

    /// Seconds of padding added after a cue-out point.
    #[arg(long, default_value_t = 0.0)]
    pub cue_out_point_padding: f64,

    /// Path to a MIDI mapping file. Stored and forwarded; the mapping
    /// itself is interpreted by the external MIDI-mapping collaborator,
    /// not the core.
    #[arg(long)]
    pub midi_mapping: Option<String>,

    /// Repeatable `N:LABEL` pairs naming ingest streams for display.
    #[arg(long = "source-label", value_parser = parse_source_label)]
    pub source_labels_raw: Vec<(u32, String)>,
}

impl Flags {
    pub fn source_labels(&self) -> HashMap<u32, String> {
        self.source_labels_raw.iter().cloned().collect()
    }

    /// Validates cross-field constraints not expressible via `clap`
    /// attributes alone, in the style of `CaptureConfig::validate`.
    pub fn validate(&self) -> Result<(), String> {
        if self.width == 0 || self.height == 0 {
            return Err("width and height must be nonzero".to_string());
        }
        if self.interpolation_quality > 4 {
            return Err("interpolation-quality must be 0..=4".to_string());
        }
        if self.frame_rate.numerator == 0 || self.frame_rate.denominator == 0 {
            return Err("frame-rate must have nonzero numerator and denominator".to_string());
        }
        Ok(())
    }
}

/// `N/M` frames-per-second ratio, e.g. `60000/1001` for 59.94 fps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameRate {
    pub numerator: u32,
    pub denominator: u32,
}

impl FrameRate {
    pub fn as_f64(&self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }
}

fn parse_frame_rate(s: &str) -> Result<FrameRate, String> {
    match s.split_once('/') {
        Some((num, den)) => {
            let numerator: u32 = num.parse().map_err(|_| format!("bad numerator: {num}"))?;
            let denominator: u32 = den.parse().map_err(|_| format!("bad denominator: {den}"))?;
            Ok(FrameRate { numerator, denominator })
        }
        None => {
            let numerator: u32 = s.parse().map_err(|_| format!("bad frame rate: {s}"))?;
            Ok(FrameRate { numerator, denominator: 1 })
        }
    }
}

fn parse_source_label(s: &str) -> Result<(u32, String), String> {
    let (idx, label) = s
        .split_once(':')
        .ok_or_else(|| format!("expected N:LABEL, got {s}"))?;
    let idx: u32 = idx.parse().map_err(|_| format!("bad stream index: {idx}"))?;
    Ok((idx, label.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ntsc_frame_rate() {
        let fr = parse_frame_rate("60000/1001").unwrap();
        assert!((fr.as_f64() - 59.94).abs() < 0.01);
    }

    #[test]
    fn parses_bare_integer_frame_rate() {
        let fr = parse_frame_rate("25").unwrap();
        assert_eq!(fr.as_f64(), 25.0);
    }

    #[test]
    fn source_label_parses_index_and_text() {
        assert_eq!(
            parse_source_label("2:Wide shot").unwrap(),
            (2, "Wide shot".to_string())
        );
        assert!(parse_source_label("nope").is_err());
    }
}
