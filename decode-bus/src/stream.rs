use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn is_valid(&self) -> bool {
        self.den != 0
    }

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }

    /// Rescales `ts` expressed in `self` into `to`, rounding down.
    pub fn rescale(&self, ts: i64, to: Rational) -> i64 {
        if !self.is_valid() || !to.is_valid() || to.num == 0 {
            return ts;
        }
        let num = ts as i128 * self.num as i128 * to.den as i128;
        let den = self.den as i128 * to.num as i128;
        (num / den) as i64
    }
}

impl Default for Rational {
    fn default() -> Self {
        Self { num: 0, den: 1 }
    }
}

impl From<(i32, i32)> for Rational {
    fn from((num, den): (i32, i32)) -> Self {
        Self { num, den }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    #[default]
    Video,
    Audio,
    Data,
}

/// Stream-level decode parameters: the part of a decode context that is
/// copied forward from one thread slot to the next once the earlier slot has
/// finalized its state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamParams {
    pub media_type: MediaType,
    pub codec_id: String,
    pub time_base: Rational,
    pub frame_rate: Rational,
    pub width: u32,
    pub height: u32,
    pub coded_width: u32,
    pub coded_height: u32,
    pub pixel_format: Option<String>,
    pub sample_aspect_ratio: Rational,
    pub has_b_frames: u32,
    pub profile: Option<i32>,
    pub level: Option<i32>,
    pub bits_per_raw_sample: u32,
    pub sample_rate: u32,
    pub sample_format: Option<String>,
    pub channels: u32,
    pub extradata: Vec<u8>,
}

impl StreamParams {
    pub fn video(codec_id: &str, width: u32, height: u32, time_base: Rational) -> Self {
        Self {
            media_type: MediaType::Video,
            codec_id: codec_id.to_string(),
            time_base,
            width,
            height,
            coded_width: width,
            coded_height: height,
            ..Default::default()
        }
    }

    pub fn audio(codec_id: &str, sample_rate: u32, channels: u32) -> Self {
        Self {
            media_type: MediaType::Audio,
            codec_id: codec_id.to_string(),
            time_base: Rational::new(1, sample_rate.max(1) as i32),
            sample_rate,
            channels,
            ..Default::default()
        }
    }

    pub fn is_video(&self) -> bool {
        self.media_type == MediaType::Video
    }

    pub fn is_audio(&self) -> bool {
        self.media_type == MediaType::Audio
    }

    pub fn fps(&self) -> f32 {
        self.frame_rate.as_f64() as f32
    }

    /// Copies the fields a later slot must observe from an earlier one.
    /// Extradata is left alone: it is fixed at open time.
    pub fn copy_forward(&mut self, src: &StreamParams) {
        self.time_base = src.time_base;
        self.frame_rate = src.frame_rate;
        self.width = src.width;
        self.height = src.height;
        self.coded_width = src.coded_width;
        self.coded_height = src.coded_height;
        self.pixel_format = src.pixel_format.clone();
        self.sample_aspect_ratio = src.sample_aspect_ratio;
        self.has_b_frames = src.has_b_frames;
        self.profile = src.profile;
        self.level = src.level;
        self.bits_per_raw_sample = src.bits_per_raw_sample;
        self.sample_rate = src.sample_rate;
        self.sample_format = src.sample_format.clone();
        self.channels = src.channels;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rescale() {
        let ms = Rational::new(1, 1000);
        let ninety_khz = Rational::new(1, 90000);
        assert_eq!(ms.rescale(1000, ninety_khz), 90000);
        assert_eq!(ninety_khz.rescale(90000, ms), 1000);
        assert_eq!(ms.rescale(5, Rational::new(1, 0)), 5);
    }

    #[test]
    fn test_copy_forward_keeps_extradata() {
        let mut dst = StreamParams::video("raw", 0, 0, Rational::new(1, 25));
        dst.extradata = vec![1, 2, 3];
        let mut src = StreamParams::video("raw", 640, 480, Rational::new(1, 30));
        src.pixel_format = Some("yuv420p".into());
        src.has_b_frames = 2;
        dst.copy_forward(&src);
        assert_eq!(dst.width, 640);
        assert_eq!(dst.time_base, Rational::new(1, 30));
        assert_eq!(dst.pixel_format.as_deref(), Some("yuv420p"));
        assert_eq!(dst.has_b_frames, 2);
        assert_eq!(dst.extradata, vec![1, 2, 3]);
    }
}
