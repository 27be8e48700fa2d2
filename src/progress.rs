//! Per-file progress reporting for the sender
//!
//! The sender asks a [`ProgressFactory`] for one [`FileProgress`] per file,
//! feeds it every body byte as it is streamed, then finishes it. The
//! terminal implementation draws an indicatif byte bar.

use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Read};

/// Observer for one file's body bytes
pub trait FileProgress {
    fn advance(&mut self, chunk: &[u8]);
    fn finish(&mut self);
}

/// Creates an observer for each file the sender streams
pub trait ProgressFactory: Send + Sync {
    fn start(&self, name: &str, size: u64) -> Box<dyn FileProgress>;
}

pub struct NoProgress;

impl FileProgress for NoProgress {
    fn advance(&mut self, _chunk: &[u8]) {}
    fn finish(&mut self) {}
}

impl ProgressFactory for NoProgress {
    fn start(&self, _name: &str, _size: u64) -> Box<dyn FileProgress> {
        Box::new(NoProgress)
    }
}

/// indicatif bar per file, bytes as units
pub struct TerminalProgress;

struct TerminalBar {
    bar: ProgressBar,
}

impl FileProgress for TerminalBar {
    fn advance(&mut self, chunk: &[u8]) {
        self.bar.inc(chunk.len() as u64);
    }

    fn finish(&mut self) {
        self.bar.finish();
    }
}

impl ProgressFactory for TerminalProgress {
    fn start(&self, name: &str, size: u64) -> Box<dyn FileProgress> {
        let bar = ProgressBar::new(size);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {percent}% ({bytes_per_sec})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.set_message(name.to_string());
        Box::new(TerminalBar { bar })
    }
}

/// Reader that shows every byte it yields to a progress observer
pub struct ProgressReader<'a, R: Read, P: FileProgress + ?Sized> {
    inner: R,
    progress: &'a mut P,
}

impl<'a, R: Read, P: FileProgress + ?Sized> ProgressReader<'a, R, P> {
    pub fn new(inner: R, progress: &'a mut P) -> Self {
        Self { inner, progress }
    }
}

impl<R: Read, P: FileProgress + ?Sized> Read for ProgressReader<'_, R, P> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.progress.advance(&buf[..n]);
        Ok(n)
    }
}
