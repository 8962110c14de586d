use std::{
    io::{self, Read},
    thread::{self, JoinHandle},
};

use crate::error::{Error, Result};

const CHUNK: usize = 4096;

#[derive(Debug, Default)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

impl Captured {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Reads one pipe to its end on a helper thread. Keeps at most `limit`
/// bytes and drains the rest, so the writer never blocks on a full pipe.
pub struct Collector {
    handle: JoinHandle<io::Result<Captured>>,
}

impl Collector {
    pub fn spawn<R: Read + Send + 'static>(stream: R, limit: usize) -> Result<Self> {
        let handle = thread::Builder::new()
            .name("cage-collector".into())
            .spawn(move || collect_stream(stream, limit))?;
        Ok(Self { handle })
    }

    pub fn join(self) -> Result<Captured> {
        self.handle
            .join()
            .map_err(|_| Error::Sandbox("output collector panicked".into()))?
            .map_err(Error::from)
    }
}

fn collect_stream<R: Read>(mut stream: R, limit: usize) -> io::Result<Captured> {
    let mut captured = Captured::default();
    let mut chunk = [0u8; CHUNK];
    loop {
        let n = match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        let room = limit.saturating_sub(captured.bytes.len());
        if n > room {
            captured.bytes.extend_from_slice(&chunk[..room]);
            captured.truncated = true;
        } else {
            captured.bytes.extend_from_slice(&chunk[..n]);
        }
    }
    Ok(captured)
}
