use anyhow::{anyhow, Result};
use ffmpeg::{
    codec::Context as CodecContext, encoder, format::Pixel, Dictionary, Frame, Packet, Rational,
};
use ffmpeg_next as ffmpeg;
use log::info;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub name: String,
    pub options: HashMap<String, String>,
    pub bitrate_kbps: usize,
    pub fps: u32,
}

/// Low-latency YUV 4:2:0 video encoder for one frame geometry.
pub struct Encoder {
    encoder: encoder::Video,
    dimensions: (u32, u32),
}

impl Encoder {
    pub fn open(settings: &EncoderSettings, width: u32, height: u32) -> Result<Self> {
        let codec = encoder::find_by_name(&settings.name)
            .ok_or_else(|| anyhow!("Missing encoder {}", settings.name))?;

        let mut video = CodecContext::new_with_codec(codec).encoder().video()?;

        let fps = settings.fps.max(1);
        let frame_rate = Rational::new(fps as i32, 1);
        video.set_bit_rate(settings.bitrate_kbps * 1000);
        video.set_width(width);
        video.set_height(height);
        video.set_time_base(frame_rate.invert());
        video.set_frame_rate(Some(frame_rate));
        video.set_gop(fps * 2);
        video.set_max_b_frames(0);
        video.set_format(Pixel::YUV420P);

        let mut options = Dictionary::new();
        for (key, value) in &settings.options {
            options.set(key, value);
        }
        info!(
            "opening {} {}x{} at {} kbit/s",
            settings.name, width, height, settings.bitrate_kbps
        );

        Ok(Encoder {
            encoder: video.open_with(options)?,
            dimensions: (width, height),
        })
    }

    /// Sends one frame and collects every packet the encoder has ready.
    pub fn encode(&mut self, frame: &Frame) -> Result<Vec<Packet>> {
        self.encoder.send_frame(frame)?;
        Ok(self.drain())
    }

    /// Flushes delayed packets at end of stream.
    pub fn finish(&mut self) -> Result<Vec<Packet>> {
        self.encoder.send_eof()?;
        Ok(self.drain())
    }

    fn drain(&mut self) -> Vec<Packet> {
        let mut packets = Vec::new();
        let mut packet = Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packets.push(packet);
            packet = Packet::empty();
        }
        packets
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }
}

/// Parses `key=value` encoder options.
pub fn parse_options(options: &[String]) -> Result<HashMap<String, String>> {
    options
        .iter()
        .map(|option| {
            option
                .split_once('=')
                .filter(|(key, _)| !key.is_empty())
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .ok_or_else(|| anyhow!("encoder option {option:?} is not key=value"))
        })
        .collect()
}
