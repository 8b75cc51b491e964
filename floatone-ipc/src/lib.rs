pub mod bus;
pub mod config;
pub mod tips;

pub use bus::{BusFrame, BusRequest, ChangeEvent};
pub use config::{ConfigPatch, FloatOneConfig, RotateInterval, Theme};
pub use tips::{parse_all_tips, parse_tip_text, parse_tips_from_text, tips_to_text, ParsedTip};
