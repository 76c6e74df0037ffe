//! Bounded verbose-output channel between the stream loop and its
//! printer thread.

use std::io::Write;
use std::sync::mpsc::{sync_channel, SyncSender, TryRecvError};
use std::thread::JoinHandle;

use anyhow::{format_err, Error};

/// Capacity of the verbose output queue; a full queue blocks the packing
/// or unpacking loop rather than dropping lines.
const VERBOSE_QUEUE_SIZE: usize = 1000;

/// One printer thread draining a bounded queue of pack paths.
///
/// Dropping the queue closes the channel, lets the thread drain whatever
/// is left and joins it, so the thread cannot outlive an error exit from
/// the main loop.
pub(crate) struct VerboseQueue {
    sender: Option<SyncSender<String>>,
    thread: Option<JoinHandle<()>>,
}

impl VerboseQueue {
    pub fn spawn(mut out: Box<dyn Write + Send>) -> Self {
        let (sender, receiver) = sync_channel::<String>(VERBOSE_QUEUE_SIZE);
        let thread = std::thread::spawn(move || {
            while let Ok(line) = receiver.recv() {
                let _ = writeln!(out, "{}", line);
                // Flush once the queue runs dry so a slow stream still
                // shows progress promptly.
                loop {
                    match receiver.try_recv() {
                        Ok(line) => {
                            let _ = writeln!(out, "{}", line);
                        }
                        Err(TryRecvError::Empty) => {
                            let _ = out.flush();
                            break;
                        }
                        Err(TryRecvError::Disconnected) => {
                            let _ = out.flush();
                            return;
                        }
                    }
                }
            }
            let _ = out.flush();
        });
        VerboseQueue {
            sender: Some(sender),
            thread: Some(thread),
        }
    }

    /// Queues one line, blocking while the printer is behind.
    pub fn send(&self, line: String) -> Result<(), Error> {
        self.sender
            .as_ref()
            .ok_or_else(|| format_err!("verbose queue already closed"))?
            .send(line)
            .map_err(|_| format_err!("verbose printer thread terminated"))
    }
}

impl Drop for VerboseQueue {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn all_lines_are_printed_before_drop_returns() {
        let buf = SharedBuf(Arc::new(Mutex::new(Vec::new())));
        let queue = VerboseQueue::spawn(Box::new(buf.clone()));
        for i in 0..2000 {
            queue.send(format!("/line/{}", i)).unwrap();
        }
        drop(queue);
        let out = buf.0.lock().unwrap();
        let lines = out.split(|&b| b == b'\n').filter(|l| !l.is_empty()).count();
        assert_eq!(lines, 2000);
    }
}
