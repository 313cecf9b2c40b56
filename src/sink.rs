use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use ffmpeg_next::{
    format::Pixel,
    frame,
    software::scaling::{self, Flags},
};
use log::{trace, warn};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use kmsvnc::buffer::FrameBuffer;
use kmsvnc::capture::DisplaySink;
use kmsvnc::damage::Damage;

use crate::encoder::{Encoder, EncoderSettings};

pub struct EncodedPacket {
    pub data: Bytes,
    pub pts: Duration,
}

/// Display sink that encodes every delivered frame to H.264.
///
/// Frames are mapped, copied row by row using the buffer's stride, scaled to
/// YUV 4:2:0 and encoded. Packets go to the writer task over a channel.
pub struct EncodingSink {
    settings: EncoderSettings,
    encoder: Option<Encoder>,
    scaler: Option<(scaling::Context, Pixel)>,
    tx: UnboundedSender<EncodedPacket>,
    start: Instant,
    frame_index: i64,
}

impl EncodingSink {
    pub fn new(settings: EncoderSettings, tx: UnboundedSender<EncodedPacket>) -> Self {
        Self {
            settings,
            encoder: None,
            scaler: None,
            tx,
            start: Instant::now(),
            frame_index: 0,
        }
    }

    fn encode(&mut self, buffer: &FrameBuffer) -> Result<()> {
        let (width, height) = (buffer.width(), buffer.height());
        let format = buffer.fourcc().packed_format();

        buffer.map()?;
        let mut packed = frame::Video::new(format, width, height);
        {
            let pixels = buffer
                .pixels()
                .ok_or_else(|| anyhow!("mapped buffer exposes no pixels"))?;
            copy_rows(
                &pixels,
                buffer.stride_bytes(),
                &mut packed,
                (width * buffer.bytes_per_pixel()) as usize,
            )?;
        }
        buffer.unmap();

        self.ensure_encoder(width, height, format)?;

        let mut yuv = frame::Video::empty();
        if let Some((scaler, _)) = &mut self.scaler {
            scaler.run(&packed, &mut yuv)?;
        }
        yuv.set_pts(Some(self.frame_index));
        self.frame_index += 1;

        if let Some(encoder) = &mut self.encoder {
            for packet in encoder.encode(&yuv)? {
                self.send(packet)?;
            }
        }
        Ok(())
    }

    fn ensure_encoder(&mut self, width: u32, height: u32, format: Pixel) -> Result<()> {
        let stale = match &self.encoder {
            Some(enc) => enc.dimensions() != (width, height),
            None => true,
        };
        if stale {
            // A new geometry starts a new stream; flush what the old one had.
            self.finish()?;
            self.encoder.replace(Encoder::open(&self.settings, width, height)?);
            self.scaler = None;
        }

        if !matches!(&self.scaler, Some((_, scaler_format)) if *scaler_format == format) {
            let scaler = scaling::Context::get(
                format,
                width,
                height,
                Pixel::YUV420P,
                width,
                height,
                Flags::BILINEAR,
            )?;
            self.scaler = Some((scaler, format));
        }
        Ok(())
    }

    /// Drains the encoder. Called on shutdown and before re-creating it.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(mut encoder) = self.encoder.take() {
            for packet in encoder.finish()? {
                self.send(packet)?;
            }
        }
        Ok(())
    }

    fn send(&self, packet: ffmpeg_next::Packet) -> Result<()> {
        if let Some(data) = packet.data() {
            self.tx
                .send(EncodedPacket {
                    data: Bytes::copy_from_slice(data),
                    pts: Instant::now() - self.start,
                })
                .map_err(|_| anyhow!("packet writer has gone away"))?;
        }
        Ok(())
    }
}

impl DisplaySink for EncodingSink {
    fn feed(&mut self, buffer: Rc<FrameBuffer>, damage: &Damage) {
        if damage.is_empty() {
            return;
        }
        trace!("encoding {:?}", buffer);
        if let Err(e) = self.encode(&buffer) {
            warn!("failed to encode frame: {e:#}");
        }
        buffer.unmap();
    }
}

/// Copies `row_bytes` of every row between differently strided images.
fn copy_rows(
    src: &[u8],
    src_stride: usize,
    dst: &mut frame::Video,
    row_bytes: usize,
) -> Result<()> {
    let height = dst.height() as usize;
    let dst_stride = dst.stride(0);
    if src_stride < row_bytes || (height > 0 && src.len() < src_stride * (height - 1) + row_bytes) {
        return Err(anyhow!(
            "pixel buffer of {} bytes too small for {} rows of stride {}",
            src.len(),
            height,
            src_stride
        ));
    }

    let data = dst.data_mut(0);
    for y in 0..height {
        data[y * dst_stride..y * dst_stride + row_bytes]
            .copy_from_slice(&src[y * src_stride..y * src_stride + row_bytes]);
    }
    Ok(())
}

pub async fn write_packets<W>(mut rx: UnboundedReceiver<EncodedPacket>, mut output: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0usize;
    while let Some(packet) = rx.recv().await {
        output.write_all(&packet.data).await?;
        written += packet.data.len();
        trace!("wrote {} bytes at {:?}", packet.data.len(), packet.pts);
    }
    output.flush().await?;
    log::info!("wrote {written} bytes");
    Ok(())
}
