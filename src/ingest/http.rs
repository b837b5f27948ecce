//! HTTP JPEG frame source (ESP32-CAM style endpoints).
//!
//! Supports two endpoint shapes, chosen from the response content type:
//! - `multipart/x-mixed-replace` MJPEG streams, read continuously
//! - single JPEG snapshots, fetched again for every frame

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::Duration;

use super::VideoBackend;
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Frame source for an HTTP camera endpoint.
///
/// Network failures after the initial connect are reported as "no frame"
/// and the endpoint is reconnected on the next read.
pub struct HttpJpegBackend {
    url: String,
    agent: ureq::Agent,
    stream: HttpStream,
    frame_count: u64,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    SingleJpeg,
    Disconnected,
}

impl HttpJpegBackend {
    /// Connect to `url` and detect whether it serves MJPEG or single JPEGs.
    pub fn connect(url: &str) -> Result<Self> {
        Self::connect_with_timeouts(url, CONNECT_TIMEOUT, READ_TIMEOUT)
    }

    pub fn connect_with_timeouts(url: &str, connect: Duration, read: Duration) -> Result<Self> {
        url::Url::parse(url).context("parse http source url")?;
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(connect)
            .timeout_read(read)
            .build();
        let stream = open_stream(&agent, url)?;
        log::info!(
            "HttpJpegBackend: connected to {} ({})",
            url,
            if matches!(stream, HttpStream::Mjpeg(_)) {
                "mjpeg"
            } else {
                "jpeg"
            }
        );
        Ok(Self {
            url: url.to_string(),
            agent,
            stream,
            frame_count: 0,
        })
    }

    /// Next encoded JPEG, or `None` when the endpoint timed out or dropped.
    fn next_jpeg(&mut self) -> Result<Option<Vec<u8>>> {
        if matches!(self.stream, HttpStream::Disconnected) {
            match open_stream(&self.agent, &self.url) {
                Ok(stream) => {
                    log::info!("HttpJpegBackend: reconnected to {}", self.url);
                    self.stream = stream;
                }
                Err(e) => {
                    log::warn!("HttpJpegBackend: reconnect to {} failed: {:#}", self.url, e);
                    return Ok(None);
                }
            }
        }
        let fetched = match &mut self.stream {
            HttpStream::Mjpeg(stream) => stream.read_next_jpeg(),
            HttpStream::SingleJpeg => fetch_single_jpeg(&self.agent, &self.url),
            HttpStream::Disconnected => return Ok(None),
        };
        match fetched {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) => {
                log::warn!("HttpJpegBackend: {} read failed: {:#}", self.url, e);
                self.stream = HttpStream::Disconnected;
                Ok(None)
            }
        }
    }
}

impl VideoBackend for HttpJpegBackend {
    fn name(&self) -> &'static str {
        "http-jpeg"
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        let Some(bytes) = self.next_jpeg()? else {
            return Ok(None);
        };
        let image = image::load_from_memory(&bytes).context("decode jpeg")?;
        let frame = Frame::from_image(image.into_rgb8(), self.frame_count);
        self.frame_count += 1;
        Ok(Some(frame))
    }

    fn skip(&mut self) -> Result<()> {
        // Undecoded; only the stream position matters.
        if self.next_jpeg()?.is_some() {
            self.frame_count += 1;
        }
        Ok(())
    }
}

fn open_stream(agent: &ureq::Agent, url: &str) -> Result<HttpStream> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("connect to http source {}", url))?;
    let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
    if content_type.contains("multipart") {
        Ok(HttpStream::Mjpeg(MjpegStream::new(response.into_reader())))
    } else {
        Ok(HttpStream::SingleJpeg)
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let jpeg = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(jpeg);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_single_jpeg(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("fetch jpeg from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64 + 1)
        .read_to_end(&mut bytes)
        .context("read jpeg body")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg response"));
    }
    if bytes.len() > MAX_JPEG_BYTES {
        return Err(anyhow!("jpeg response exceeds {} bytes", MAX_JPEG_BYTES));
    }
    Ok(bytes)
}

/// Locate the first complete SOI..EOI JPEG in `buffer`.
///
/// SOI/EOI pairs nested inside it (EXIF thumbnails) are skipped; the
/// outer image ends at the EOI that balances its SOI.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let mut depth = 0usize;
    let mut i = start;
    while i + 1 < buffer.len() {
        match (buffer[i], buffer[i + 1]) {
            (0xFF, 0xD8) => {
                depth += 1;
                i += 2;
            }
            (0xFF, 0xD9) => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return Some((start, i));
                }
            }
            _ => i += 1,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;
    use std::time::Instant;

    #[test]
    fn finds_jpeg_markers_in_multipart_noise() {
        let mut buf = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        let jpeg_start = buf.len();
        buf.extend_from_slice(&[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]);
        buf.extend_from_slice(b"\r\n--frame");
        let (start, end) = find_jpeg_bounds(&buf).unwrap();
        assert_eq!(start, jpeg_start);
        assert_eq!(&buf[start..end], &[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]);
    }

    #[test]
    fn incomplete_jpeg_is_not_returned() {
        assert!(find_jpeg_bounds(&[0xFF, 0xD8, 1, 2]).is_none());
        assert!(find_jpeg_bounds(b"no markers").is_none());
    }

    #[test]
    fn exif_thumbnail_does_not_end_the_frame() {
        let frame = [
            0xFF, 0xD8, 0xFF, 0xE1, // SOI, APP1
            0xFF, 0xD8, 7, 7, 0xFF, 0xD9, // thumbnail
            1, 2, 3, 0xFF, 0xD9,
        ];
        let mut buf = b"--frame\r\n\r\n".to_vec();
        let offset = buf.len();
        buf.extend_from_slice(&frame);
        buf.extend_from_slice(b"\r\n--frame\r\n\r\n");
        buf.extend_from_slice(&[0xFF, 0xD8, 9, 0xFF, 0xD9]);

        let (start, end) = find_jpeg_bounds(&buf).unwrap();
        assert_eq!((start, end), (offset, offset + frame.len()));
        assert!(find_jpeg_bounds(&frame[..frame.len() - 2]).is_none());
    }

    fn jpeg_bytes() -> Vec<u8> {
        let mut bytes = Vec::new();
        image::RgbImage::from_pixel(8, 8, image::Rgb([200, 200, 200]))
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Jpeg)
            .unwrap();
        bytes
    }

    /// Accepts one connection, runs `respond` on it, then holds it open.
    fn stalled_server(respond: impl FnOnce(&mut TcpStream) + Send + 'static) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut conn, _)) = listener.accept() {
                respond(&mut conn);
                thread::sleep(Duration::from_secs(5));
            }
        });
        format!("http://{}/stream", addr)
    }

    #[test]
    fn silent_endpoint_fails_connect_within_timeout() {
        let url = stalled_server(|_| {});
        let started = Instant::now();
        let result = HttpJpegBackend::connect_with_timeouts(
            &url,
            Duration::from_millis(200),
            Duration::from_millis(200),
        );
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn stalled_mjpeg_stream_reads_as_no_frame() {
        let jpeg = jpeg_bytes();
        let url = stalled_server(move |conn| {
            let head = "HTTP/1.1 200 OK\r\n\
                        Content-Type: multipart/x-mixed-replace; boundary=frame\r\n\r\n\
                        --frame\r\nContent-Type: image/jpeg\r\n\r\n";
            conn.write_all(head.as_bytes()).unwrap();
            conn.write_all(&jpeg).unwrap();
            conn.write_all(b"\r\n").unwrap();
            conn.flush().unwrap();
        });
        let mut backend = HttpJpegBackend::connect_with_timeouts(
            &url,
            Duration::from_millis(500),
            Duration::from_millis(200),
        )
        .unwrap();

        let frame = backend.read().unwrap().expect("first frame");
        assert_eq!((frame.width, frame.height), (8, 8));

        let started = Instant::now();
        assert!(backend.read().unwrap().is_none());
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
