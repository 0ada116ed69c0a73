//! Compression detection and transparent decompression.
//!
//! Archives and layer blobs may come plain, gzip or zstd compressed.  Archives are recognized by
//! their magic bytes, layers by their media type.

use std::io::{self, BufReader, Read};

use flate2::bufread::MultiGzDecoder;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Number of leading bytes [`Compression::detect`] looks at.
pub const MAGIC_LEN: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Zstd,
}

impl Compression {
    /// Detect compression from the first bytes of a stream.
    pub fn detect(data: &[u8]) -> Self {
        if data.starts_with(&GZIP_MAGIC) {
            Compression::Gzip
        } else if data.starts_with(&ZSTD_MAGIC) {
            Compression::Zstd
        } else {
            Compression::None
        }
    }

    /// Compression of a layer blob, judging by its media type.
    ///
    /// Returns `None` for media types that aren't tar layers at all.
    pub fn from_layer_media_type(media_type: &str) -> Option<Self> {
        match media_type {
            "application/vnd.oci.image.layer.v1.tar"
            | "application/vnd.oci.image.layer.nondistributable.v1.tar"
            | "application/vnd.docker.image.rootfs.diff.tar" => Some(Compression::None),
            "application/vnd.oci.image.layer.v1.tar+gzip"
            | "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip"
            | "application/vnd.docker.image.rootfs.diff.tar.gzip"
            | "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip" => {
                Some(Compression::Gzip)
            }
            "application/vnd.oci.image.layer.v1.tar+zstd"
            | "application/vnd.oci.image.layer.nondistributable.v1.tar+zstd" => {
                Some(Compression::Zstd)
            }
            _ => None,
        }
    }

    /// Wrap `reader` so that it yields decompressed data.
    pub fn decompress<'a>(self, reader: impl Read + 'a) -> io::Result<Box<dyn Read + 'a>> {
        Ok(match self {
            Compression::None => Box::new(reader),
            Compression::Gzip => Box::new(MultiGzDecoder::new(BufReader::new(reader))),
            Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(reader)?),
        })
    }
}

/// Read as many bytes as are needed to fill `buf`, stopping early only at EOF.
///
/// Returns the number of bytes read, retrying on EINTR.
pub(crate) fn read_prefix(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Detect the compression of `reader` and return a reader yielding the decompressed stream.
///
/// The magic bytes are consumed from `reader` and replayed, so nothing is read twice.
pub fn auto_decompress<'a>(
    mut reader: impl Read + 'a,
) -> io::Result<(Compression, Box<dyn Read + 'a>)> {
    let mut magic = [0u8; MAGIC_LEN];
    let n = read_prefix(&mut reader, &mut magic)?;
    let compression = Compression::detect(&magic[..n]);
    let replayed = io::Cursor::new(magic[..n].to_vec()).chain(reader);
    Ok((compression, compression.decompress(replayed)?))
}

/// A reader that remembers the first [`MAGIC_LEN`] bytes passing through it.
pub(crate) struct MagicSniffer<R> {
    inner: R,
    magic: [u8; MAGIC_LEN],
    seen: usize,
}

impl<R: Read> MagicSniffer<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            magic: [0; MAGIC_LEN],
            seen: 0,
        }
    }

    pub(crate) fn compression(&self) -> Compression {
        Compression::detect(&self.magic[..self.seen])
    }

    pub(crate) fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for MagicSniffer<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        let take = (MAGIC_LEN - self.seen).min(n);
        self.magic[self.seen..self.seen + take].copy_from_slice(&buf[..take]);
        self.seen += take;
        Ok(n)
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use flate2::{write::GzEncoder, Compression as GzLevel};
    use similar_asserts::assert_eq;

    use super::*;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn read_all(mut reader: impl Read) -> Vec<u8> {
        let mut out = vec![];
        reader.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_detect() {
        assert_eq!(Compression::detect(&gzip(b"x")), Compression::Gzip);
        assert_eq!(
            Compression::detect(&zstd::encode_all(&b"x"[..], 0).unwrap()),
            Compression::Zstd
        );
        assert_eq!(Compression::detect(b"ustar"), Compression::None);
        assert_eq!(Compression::detect(b""), Compression::None);
        assert_eq!(Compression::detect(&[0x1f]), Compression::None);
    }

    #[test]
    fn test_auto_decompress() {
        let payload = b"a tar stream, pretend".repeat(100);
        let inputs = [
            (payload.clone(), Compression::None),
            (gzip(&payload), Compression::Gzip),
            (zstd::encode_all(&payload[..], 3).unwrap(), Compression::Zstd),
        ];
        for (input, expected) in inputs {
            let (compression, reader) = auto_decompress(&input[..]).unwrap();
            assert_eq!(compression, expected);
            assert_eq!(read_all(reader), payload);
        }

        // shorter than the magic
        let (compression, reader) = auto_decompress(&b"ab"[..]).unwrap();
        assert_eq!(compression, Compression::None);
        assert_eq!(read_all(reader), b"ab".to_vec());
    }

    #[test]
    fn test_magic_sniffer_sees_across_small_reads() {
        let data = gzip(b"layer");
        let mut sniffer = MagicSniffer::new(&data[..]);
        let mut byte = [0u8; 1];
        for _ in 0..3 {
            sniffer.read_exact(&mut byte).unwrap();
        }
        read_all(&mut sniffer);
        assert_eq!(sniffer.compression(), Compression::Gzip);
    }

    #[test]
    fn test_layer_media_types() {
        assert_eq!(
            Compression::from_layer_media_type("application/vnd.oci.image.layer.v1.tar+gzip"),
            Some(Compression::Gzip)
        );
        assert_eq!(
            Compression::from_layer_media_type("application/vnd.docker.image.rootfs.diff.tar"),
            Some(Compression::None)
        );
        assert_eq!(
            Compression::from_layer_media_type("application/vnd.oci.image.config.v1+json"),
            None
        );
    }
}
