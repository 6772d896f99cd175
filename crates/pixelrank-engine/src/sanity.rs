use pixelrank_contracts::config::RankingConfig;

/// Hard floors applied before a candidate is scored or ranked.
pub fn passes_floors(brightness: f64, entropy: f64, config: &RankingConfig) -> bool {
    entropy >= config.entropy_min
        && brightness >= config.brightness_min
        && brightness <= config.brightness_max
}

/// Human-readable reason for a floor rejection, `None` when the floors pass.
pub fn floor_violation(brightness: f64, entropy: f64, config: &RankingConfig) -> Option<String> {
    if entropy < config.entropy_min {
        return Some(format!(
            "entropy {entropy:.3} below floor {:.3}",
            config.entropy_min
        ));
    }
    if brightness < config.brightness_min {
        return Some(format!(
            "brightness {brightness:.2} below floor {:.2}",
            config.brightness_min
        ));
    }
    if brightness > config.brightness_max {
        return Some(format!(
            "brightness {brightness:.2} above ceiling {:.2}",
            config.brightness_max
        ));
    }
    if brightness.is_nan() || entropy.is_nan() {
        return Some("metrics are not numbers".to_string());
    }
    None
}
