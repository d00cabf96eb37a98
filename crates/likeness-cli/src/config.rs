use std::path::Path;

use anyhow::{Context, Result};
use likeness_core::{CropMode, CurationConfig, NoConsensusPolicy, StrategyKind};

/// Load the curation config: optional TOML file, then `LIKENESS_*`
/// environment overrides, then validation.
pub fn load(path: Option<&Path>) -> Result<CurationConfig> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            from_toml(&text).with_context(|| format!("parsing config {}", path.display()))?
        }
        None => CurationConfig::default(),
    };

    apply_env(&mut config, |key| std::env::var(key).ok());
    config.validate()?;

    tracing::debug!(?config, "effective configuration");
    Ok(config)
}

pub fn from_toml(text: &str) -> Result<CurationConfig> {
    Ok(toml::from_str(text)?)
}

pub fn to_toml(config: &CurationConfig) -> Result<String> {
    Ok(toml::to_string_pretty(config)?)
}

/// Override fields from environment variables looked up through `var`.
///
/// Unparseable values are ignored with a warning and the prior value kept.
pub fn apply_env<F>(config: &mut CurationConfig, var: F)
where
    F: Fn(&str) -> Option<String>,
{
    let crop = &mut config.crop;
    override_with(&var, "LIKENESS_FACE_SCALE", &mut crop.face_scale);
    override_with(&var, "LIKENESS_FACE_SHIFT", &mut crop.face_shift);
    override_with(&var, "LIKENESS_BODY_SCALE", &mut crop.body_scale);
    override_with(&var, "LIKENESS_BODY_SHIFT", &mut crop.body_shift);

    let consensus = &mut config.consensus;
    override_with::<StrategyKind, _>(&var, "LIKENESS_STRATEGY", &mut consensus.strategy);
    override_with(&var, "LIKENESS_THRESHOLD", &mut consensus.threshold);
    override_with(&var, "LIKENESS_MIN_SAMPLES", &mut consensus.min_samples);
    if let Some(eps) = parse_var::<f32, _>(&var, "LIKENESS_EPS") {
        consensus.eps = Some(eps);
    }

    override_with::<NoConsensusPolicy, _>(&var, "LIKENESS_NO_CONSENSUS", &mut config.no_consensus);

    if let Some(raw) = var("LIKENESS_MODES") {
        match raw
            .split(',')
            .map(|m| m.trim().parse::<CropMode>())
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(modes) => config.modes = modes,
            Err(e) => tracing::warn!(key = "LIKENESS_MODES", value = %raw, error = %e, "ignoring override"),
        }
    }
}

fn override_with<T, F>(var: &F, key: &str, slot: &mut T)
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = parse_var(var, key) {
        *slot = value;
    }
}

fn parse_var<T, F>(var: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable override");
            None
        }
    }
}
