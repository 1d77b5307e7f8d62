use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing::debug;

/// A `Publisher` performs the actual I/O against the target during a trial.
///
/// Stream-based publishers implement `start`/`stop`, `send`/`receive` and the
/// connection verbs; call-based publishers implement `start`/`stop` and `call`.
/// Unsupported verbs fail with an error naming the action.
pub trait Publisher: Send {
    /// Changes state so that send/receive work, e.g. opening a file or a socket.
    fn start(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn accept(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn connect(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn send(&mut self, _data: &[u8]) -> Result<(), anyhow::Error> {
        anyhow::bail!("Action 'send' not supported by publisher")
    }

    /// Receives up to `size` bytes, or whatever is available when `size` is `None`.
    fn receive(&mut self, _size: Option<usize>) -> Result<Vec<u8>, anyhow::Error> {
        anyhow::bail!("Action 'receive' not supported by publisher")
    }

    fn call(&mut self, _method: &str, _args: &[Vec<u8>]) -> Result<Option<Vec<u8>>, anyhow::Error> {
        anyhow::bail!("Action 'call' not supported by publisher")
    }

    /// Gets a property when `value` is `None`, sets it otherwise.
    fn property(
        &mut self,
        _property: &str,
        _value: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, anyhow::Error> {
        anyhow::bail!("Action 'property' not supported by publisher")
    }
}

/// Writes sent data to a file and reads it back on receive.
///
/// Args: `[path]`. `start` truncates the file, `send` appends to it, `receive`
/// reads from the start of the file, `close`/`stop` release the handle.
#[derive(Debug)]
pub struct FilePublisher {
    path: PathBuf,
    file: Option<File>,
    read_offset: usize,
}

impl FilePublisher {
    pub const CLASS_ID: &'static str = "File";

    pub fn from_args(args: &[String]) -> Result<Self, anyhow::Error> {
        let path = args
            .first()
            .map(PathBuf::from)
            .ok_or_else(|| anyhow::anyhow!("File publisher requires a file path argument"))?;
        Ok(Self {
            path,
            file: None,
            read_offset: 0,
        })
    }

    fn handle(&mut self) -> Result<&mut File, anyhow::Error> {
        if self.file.is_none() {
            self.start()?;
        }
        self.file
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("File publisher {:?} is not open", self.path))
    }
}

impl Publisher for FilePublisher {
    fn start(&mut self) -> Result<(), anyhow::Error> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| anyhow::anyhow!("Failed to open {:?}: {}", self.path, e))?;
        debug!(path = ?self.path, "file publisher opened");
        self.file = Some(file);
        self.read_offset = 0;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), anyhow::Error> {
        self.close()
    }

    fn close(&mut self) -> Result<(), anyhow::Error> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<(), anyhow::Error> {
        let file = self.handle()?;
        file.write_all(data)?;
        Ok(())
    }

    fn receive(&mut self, size: Option<usize>) -> Result<Vec<u8>, anyhow::Error> {
        self.handle()?.flush()?;
        let mut contents = Vec::new();
        File::open(&self.path)?.read_to_end(&mut contents)?;
        let available = &contents[self.read_offset.min(contents.len())..];
        let take = size.map_or(available.len(), |n| n.min(available.len()));
        let chunk = available[..take].to_vec();
        self.read_offset += take;
        Ok(chunk)
    }
}

/// In-memory echo: everything sent is queued and handed back by `receive`;
/// `call` returns its first argument. `accept`/`connect` open the link and
/// `close` drops it along with any unread bytes; the read-only `links` property
/// counts the opens.
#[derive(Debug, Default)]
pub struct LoopbackPublisher {
    buffer: VecDeque<u8>,
    links: u32,
    properties: std::collections::BTreeMap<String, Vec<u8>>,
}

impl LoopbackPublisher {
    pub const CLASS_ID: &'static str = "Loopback";

    pub fn new() -> Self {
        Self::default()
    }
}

impl Publisher for LoopbackPublisher {
    fn stop(&mut self) -> Result<(), anyhow::Error> {
        self.buffer.clear();
        Ok(())
    }

    fn accept(&mut self) -> Result<(), anyhow::Error> {
        self.links += 1;
        Ok(())
    }

    fn connect(&mut self) -> Result<(), anyhow::Error> {
        self.links += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), anyhow::Error> {
        self.buffer.clear();
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<(), anyhow::Error> {
        self.buffer.extend(data.iter().copied());
        Ok(())
    }

    fn receive(&mut self, size: Option<usize>) -> Result<Vec<u8>, anyhow::Error> {
        let take = size.map_or(self.buffer.len(), |n| n.min(self.buffer.len()));
        Ok(self.buffer.drain(..take).collect())
    }

    fn call(&mut self, _method: &str, args: &[Vec<u8>]) -> Result<Option<Vec<u8>>, anyhow::Error> {
        Ok(args.first().cloned())
    }

    fn property(
        &mut self,
        property: &str,
        value: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, anyhow::Error> {
        match value {
            Some(value) => {
                self.properties.insert(property.to_string(), value.to_vec());
                Ok(None)
            }
            None if property == "links" => Ok(Some(self.links.to_string().into_bytes())),
            None => Ok(self.properties.get(property).cloned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_echoes_sent_bytes_in_order() {
        let mut publisher = LoopbackPublisher::new();
        publisher.send(b"abc").unwrap();
        publisher.send(b"def").unwrap();
        assert_eq!(publisher.receive(Some(4)).unwrap(), b"abcd".to_vec());
        assert_eq!(publisher.receive(None).unwrap(), b"ef".to_vec());
        assert!(publisher.receive(None).unwrap().is_empty());
    }

    #[test]
    fn loopback_close_drops_unread_bytes() {
        let mut publisher = LoopbackPublisher::new();
        publisher.connect().unwrap();
        publisher.accept().unwrap();
        publisher.send(b"pending").unwrap();
        publisher.close().unwrap();
        assert_eq!(publisher.property("links", None).unwrap(), Some(b"2".to_vec()));
        assert!(publisher.receive(None).unwrap().is_empty());
    }

    #[test]
    fn loopback_properties_get_what_was_set() {
        let mut publisher = LoopbackPublisher::new();
        assert_eq!(publisher.property("mode", None).unwrap(), None);
        publisher.property("mode", Some(b"fast")).unwrap();
        assert_eq!(
            publisher.property("mode", None).unwrap(),
            Some(b"fast".to_vec())
        );
    }

    #[test]
    fn file_publisher_requires_a_path() {
        assert!(FilePublisher::from_args(&[]).is_err());
    }

    #[test]
    fn file_publisher_reads_back_what_it_wrote() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fuzzed.bin");
        let mut publisher =
            FilePublisher::from_args(&[path.to_string_lossy().into_owned()]).unwrap();

        publisher.start().unwrap();
        publisher.send(b"\x00\x01payload").unwrap();
        assert_eq!(publisher.receive(Some(2)).unwrap(), vec![0u8, 1u8]);
        assert_eq!(publisher.receive(None).unwrap(), b"payload".to_vec());
        publisher.close().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"\x00\x01payload".to_vec());
    }

    #[test]
    fn unsupported_actions_name_the_action() {
        struct SendOnly;
        impl Publisher for SendOnly {}

        let err = SendOnly.call("launch", &[]).unwrap_err();
        assert!(err.to_string().contains("'call'"));
    }
}
