use std::io::{BufRead, BufReader, ErrorKind};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::protocol::{read_frame, Event, FrameWriter};
use crate::satellite::Satellite;

/// Accept poll interval; the listener is nonblocking so shutdown is
/// observed without closing the handle from another thread.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Idle read timeout between frames; re-checks the run flag.
const READ_TIMEOUT: Duration = Duration::from_millis(500);

pub fn bind(port: u16) -> Result<TcpListener> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .with_context(|| format!("failed to bind port {port}"))?;
    listener
        .set_nonblocking(true)
        .context("failed to make listener nonblocking")?;
    Ok(listener)
}

/// Accept loop. One controller at a time: the handler is joined before the
/// next connection is accepted.
pub fn run(listener: TcpListener, satellite: Arc<Satellite>, running: Arc<AtomicBool>) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "wyoming server listening");
    }

    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                info!(%addr, "controller connected");
                let handler_satellite = Arc::clone(&satellite);
                let handler_running = Arc::clone(&running);
                let handle = std::thread::Builder::new()
                    .name("connection".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, handler_satellite, handler_running)
                        {
                            warn!(error = %format!("{err:#}"), "connection closed on error");
                        }
                    })
                    .expect("failed to spawn connection handler");
                let _ = handle.join();
                info!(%addr, "controller disconnected");
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
    debug!("server loop exited");
}

fn handle_connection(
    stream: TcpStream,
    satellite: Arc<Satellite>,
    running: Arc<AtomicBool>,
) -> Result<()> {
    // The accepted socket may inherit the listener's nonblocking mode.
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    let control = stream.try_clone()?;
    let writer = Arc::new(FrameWriter::new(stream.try_clone()?));
    satellite.attach_controller(Arc::clone(&writer));

    let mut reader = BufReader::new(stream);
    let result = read_loop(&mut reader, &control, &satellite, &writer, &running);

    satellite.detach_controller();
    result
}

fn read_loop(
    reader: &mut BufReader<TcpStream>,
    control: &TcpStream,
    satellite: &Arc<Satellite>,
    writer: &Arc<FrameWriter<TcpStream>>,
    running: &Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if !running.load(Ordering::SeqCst) {
            return Ok(());
        }

        // Wait for the next frame to begin under the idle timeout, so a
        // timeout never splits a half-read header.
        match reader.fill_buf() {
            Ok([]) => return Ok(()),
            Ok(_) => {}
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                continue;
            }
            Err(err) => return Err(err.into()),
        }

        // A frame has begun; read it whole without the idle timeout.
        control.set_read_timeout(None)?;
        let frame = read_frame(reader);
        control.set_read_timeout(Some(READ_TIMEOUT))?;

        match frame {
            Ok(Some(frame)) => {
                let event = Event::from_frame(frame).context("bad inbound event")?;
                satellite.handle_event(event, writer);
            }
            Ok(None) => return Ok(()),
            Err(err) => return Err(err).context("frame read failed"),
        }
    }
}
