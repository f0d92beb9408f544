//! Bounded in-memory pipe between the archive producer and its reader.
//!
//! The writer blocks once `depth` chunks are in flight, so the archive is
//! never held in memory as a whole. The producer ends the stream either with
//! [`PipeWriter::close`] (clean end-of-stream) or with
//! [`PipeWriter::close_with_error`], whose error the reader returns from
//! `read`. A writer dropped without doing either makes the reader fail with
//! `UnexpectedEof`, so a crashed producer can never pass for a complete
//! archive.

use crate::ArchiveError;
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, SyncSender};

enum Message {
    Data(Vec<u8>),
    Finished,
    Failed(ArchiveError),
}

pub fn pipe(depth: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::sync_channel(depth);
    (
        PipeWriter { tx, closed: false },
        PipeReader {
            state: ReadState::Open(rx),
            chunk: Vec::new(),
            pos: 0,
        },
    )
}

pub struct PipeWriter {
    tx: SyncSender<Message>,
    closed: bool,
}

impl PipeWriter {
    /// End the stream successfully.
    pub fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.tx.send(Message::Finished).map_err(|_| disconnected())
    }

    /// End the stream with `err`; later writes fail immediately.
    pub fn close_with_error(&mut self, err: ArchiveError) {
        if self.closed {
            return;
        }
        self.closed = true;
        // A reader that is already gone has nobody to report to.
        let _ = self.tx.send(Message::Failed(err));
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write to a closed archive pipe",
            ));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(Message::Data(buf.to_vec()))
            .map_err(|_| disconnected())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn disconnected() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "archive reader disconnected")
}

enum ReadState {
    Open(Receiver<Message>),
    Finished,
    Failed,
}

pub struct PipeReader {
    state: ReadState,
    chunk: Vec<u8>,
    pos: usize,
}

impl PipeReader {
    /// Stop reading. Pending and future writes on the other end fail.
    pub fn close(&mut self) {
        if matches!(self.state, ReadState::Open(_)) {
            self.state = ReadState::Failed;
        }
        self.chunk = Vec::new();
        self.pos = 0;
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.pos < self.chunk.len() {
                let n = buf.len().min(self.chunk.len() - self.pos);
                buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }

            let rx = match &self.state {
                ReadState::Open(rx) => rx,
                ReadState::Finished => return Ok(0),
                ReadState::Failed => {
                    return Err(io::Error::other("archive stream already failed"));
                }
            };

            match rx.recv() {
                Ok(Message::Data(data)) => {
                    self.chunk = data;
                    self.pos = 0;
                }
                Ok(Message::Finished) => {
                    self.state = ReadState::Finished;
                    return Ok(0);
                }
                Ok(Message::Failed(err)) => {
                    self.state = ReadState::Failed;
                    return Err(io::Error::other(err));
                }
                Err(mpsc::RecvError) => {
                    self.state = ReadState::Failed;
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "archive producer exited before finishing the stream",
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::thread;

    #[test]
    fn bytes_arrive_in_order() {
        let (mut w, mut r) = pipe(2);
        let producer = thread::spawn(move || {
            for i in 0..100u8 {
                w.write_all(&[i; 7]).unwrap();
            }
            w.close().unwrap();
        });
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        producer.join().unwrap();

        let expected: Vec<u8> = (0..100u8).flat_map(|i| [i; 7]).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn small_reads_drain_large_chunks() {
        let (mut w, mut r) = pipe(1);
        let producer = thread::spawn(move || {
            w.write_all(b"hello world").unwrap();
            w.close().unwrap();
        });
        let mut buf = [0u8; 3];
        let mut out = Vec::new();
        loop {
            let n = r.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        producer.join().unwrap();
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn producer_error_becomes_read_error() {
        let (mut w, mut r) = pipe(4);
        w.write_all(b"partial").unwrap();
        w.close_with_error(ArchiveError::Access {
            path: PathBuf::from("/gone"),
            source: io::Error::from(io::ErrorKind::NotFound),
        });

        let mut out = Vec::new();
        let err = r.read_to_end(&mut out).unwrap_err();
        assert_eq!(out, b"partial");
        let err = ArchiveError::from_stream(err);
        assert!(matches!(err, ArchiveError::Access { .. }));

        // the failure is sticky
        assert!(r.read(&mut [0u8; 8]).is_err());
    }

    #[test]
    fn dropped_writer_is_not_a_clean_eof() {
        let (mut w, mut r) = pipe(4);
        w.write_all(b"abc").unwrap();
        drop(w);

        let mut out = Vec::new();
        let err = r.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn closed_reader_breaks_writer() {
        let (mut w, mut r) = pipe(1);
        r.close();
        drop(r);
        let err = w.write_all(b"data").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn write_after_close_fails() {
        let (mut w, _r) = pipe(4);
        w.close().unwrap();
        assert!(w.write(b"late").is_err());
    }
}
