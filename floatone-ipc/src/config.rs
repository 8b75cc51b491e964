use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    Light,
    #[default]
    Dark,
    System,
}

impl std::str::FromStr for Theme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "light" => Ok(Theme::Light),
            "dark" => Ok(Theme::Dark),
            "system" => Ok(Theme::System),
            _ => Err(format!("Unknown theme: {} (use light, dark, system)", s)),
        }
    }
}

impl std::fmt::Display for Theme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
            Theme::System => "system",
        };
        f.write_str(name)
    }
}

/// Tip rotation interval in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RotateInterval(pub u32);

impl RotateInterval {
    pub const MIN_SECS: u32 = 30;

    pub fn secs(self) -> u32 {
        self.0
    }

    pub fn validate(self) -> Result<(), String> {
        if self.0 < Self::MIN_SECS {
            return Err(format!(
                "rotate interval must be at least {} seconds, got {}",
                Self::MIN_SECS,
                self.0
            ));
        }
        Ok(())
    }
}

impl Default for RotateInterval {
    fn default() -> Self {
        Self(60)
    }
}

/// Settings shared by the tip bar and the settings panel.
/// Fields missing from stored JSON fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FloatOneConfig {
    pub tips: Vec<String>,
    pub auto_rotate: bool,
    pub rotate_interval: RotateInterval,
    pub theme: Theme,
    pub auto_start: bool,
}

impl Default for FloatOneConfig {
    fn default() -> Self {
        Self {
            tips: vec![
                "先持续，后加量！\n> 至少一个月，到 8-26".to_string(),
                "必须挣钱！不只是生存！".to_string(),
                "多行提示示例\n第二行内容\n> 这是补充描述".to_string(),
            ],
            auto_rotate: true,
            rotate_interval: RotateInterval::default(),
            theme: Theme::Dark,
            auto_start: true,
        }
    }
}

impl FloatOneConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.rotate_interval.validate()
    }
}

/// Partial update merged over the current config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tips: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_rotate: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotate_interval: Option<RotateInterval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<Theme>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_start: Option<bool>,
}

impl ConfigPatch {
    pub fn is_empty(&self) -> bool {
        self.tips.is_none()
            && self.auto_rotate.is_none()
            && self.rotate_interval.is_none()
            && self.theme.is_none()
            && self.auto_start.is_none()
    }

    pub fn apply(&self, base: &FloatOneConfig) -> FloatOneConfig {
        FloatOneConfig {
            tips: self.tips.clone().unwrap_or_else(|| base.tips.clone()),
            auto_rotate: self.auto_rotate.unwrap_or(base.auto_rotate),
            rotate_interval: self.rotate_interval.unwrap_or(base.rotate_interval),
            theme: self.theme.unwrap_or(base.theme),
            auto_start: self.auto_start.unwrap_or(base.auto_start),
        }
    }
}
