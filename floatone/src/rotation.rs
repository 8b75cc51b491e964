use std::time::Duration;

use floatone_ipc::{parse_all_tips, FloatOneConfig, ParsedTip, RotateInterval};

/// The part of the config the tip bar reacts to
#[derive(Debug, Clone, PartialEq)]
pub struct RotationSettings {
    pub tips: Vec<String>,
    pub auto_rotate: bool,
    pub rotate_interval: RotateInterval,
}

impl From<&FloatOneConfig> for RotationSettings {
    fn from(config: &FloatOneConfig) -> Self {
        Self {
            tips: config.tips.clone(),
            auto_rotate: config.auto_rotate,
            rotate_interval: config.rotate_interval,
        }
    }
}

/// Which tip the tip bar shows
#[derive(Debug)]
pub struct Rotation {
    tips: Vec<ParsedTip>,
    index: usize,
    auto_rotate: bool,
    interval: Duration,
}

impl Rotation {
    pub fn new(settings: &RotationSettings) -> Self {
        let mut rotation = Self {
            tips: Vec::new(),
            index: 0,
            auto_rotate: false,
            interval: Duration::ZERO,
        };
        rotation.update(settings);
        rotation
    }

    /// Adopt new settings, keeping the current index when it is still valid
    pub fn update(&mut self, settings: &RotationSettings) {
        self.tips = parse_all_tips(&settings.tips);
        self.auto_rotate = settings.auto_rotate;
        self.interval = Duration::from_secs(u64::from(settings.rotate_interval.secs()));
        if self.index >= self.tips.len() {
            self.index = 0;
        }
    }

    pub fn current(&self) -> Option<&ParsedTip> {
        self.tips.get(self.index)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_rotating(&self) -> bool {
        self.auto_rotate && self.tips.len() > 1
    }

    /// Step to the next tip. Returns whether the tip changed.
    pub fn advance(&mut self) -> bool {
        if !self.is_rotating() {
            return false;
        }
        let next = (self.index + 1) % self.tips.len();
        tracing::debug!("tip rotation: {} -> {}", self.index, next);
        self.index = next;
        true
    }
}
