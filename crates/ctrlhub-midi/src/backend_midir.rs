use parking_lot::Mutex;

use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};

use crate::transport::{MidiBackend, MidiTransport, TransportEvent, TransportSink};
use crate::{MidiError, PortDirection, PortInfo, Result};

const CLIENT_NAME: &str = "ctrlhub-midi";

/// Backend implemented using the `midir` crate.
///
/// midir has no hot-plug notifications; pair it with a
/// [`HotplugWatcher`](crate::HotplugWatcher).
#[derive(Debug, Default, Clone, Copy)]
pub struct MidirBackend;

impl MidirBackend {
    pub fn new() -> Self {
        Self
    }
}

impl MidiBackend for MidirBackend {
    fn enumerate(&self, direction: PortDirection) -> Result<Vec<PortInfo>> {
        let names = match direction {
            PortDirection::Input => {
                let input = MidiInput::new(CLIENT_NAME).map_err(backend_error)?;
                input
                    .ports()
                    .iter()
                    .enumerate()
                    .map(|(index, port)| {
                        input
                            .port_name(port)
                            .unwrap_or_else(|_| format!("Port {index}"))
                    })
                    .collect::<Vec<_>>()
            }
            PortDirection::Output => {
                let output = MidiOutput::new(CLIENT_NAME).map_err(backend_error)?;
                output
                    .ports()
                    .iter()
                    .enumerate()
                    .map(|(index, port)| {
                        output
                            .port_name(port)
                            .unwrap_or_else(|_| format!("Port {index}"))
                    })
                    .collect::<Vec<_>>()
            }
        };
        Ok(names
            .into_iter()
            .enumerate()
            .map(|(index, name)| PortInfo::new(name, direction, index))
            .collect())
    }

    fn transport(&self) -> Box<dyn MidiTransport> {
        Box::new(MidirTransport::default())
    }
}

#[derive(Default)]
struct MidirTransport {
    input: Mutex<Option<MidiInputConnection<()>>>,
    output: Mutex<Option<MidiOutputConnection>>,
}

impl MidirTransport {
    fn connect_input(&self, port: &PortInfo, sink: TransportSink) -> Result<()> {
        let mut input = MidiInput::new(CLIENT_NAME).map_err(backend_error)?;
        input.ignore(Ignore::None);
        let ports = input.ports();
        let Some(found) = ports
            .iter()
            .find(|candidate| {
                input.port_name(candidate).ok().as_deref() == Some(port.name.as_str())
            })
        else {
            return Err(MidiError::UnknownPort(port.name.clone()));
        };
        let connection = input
            .connect(
                found,
                "ctrlhub-midi-in",
                move |_timestamp, message, _| {
                    if !message.is_empty() {
                        sink(TransportEvent::Message(message));
                    }
                },
                (),
            )
            .map_err(backend_error)?;
        *self.input.lock() = Some(connection);
        Ok(())
    }

    fn connect_output(&self, port: &PortInfo) -> Result<()> {
        let output = MidiOutput::new(CLIENT_NAME).map_err(backend_error)?;
        let ports = output.ports();
        let Some(found) = ports
            .iter()
            .find(|candidate| {
                output.port_name(candidate).ok().as_deref() == Some(port.name.as_str())
            })
        else {
            return Err(MidiError::UnknownPort(port.name.clone()));
        };
        let connection = output
            .connect(found, "ctrlhub-midi-out")
            .map_err(backend_error)?;
        *self.output.lock() = Some(connection);
        Ok(())
    }
}

impl MidiTransport for MidirTransport {
    fn open(&self, input: &PortInfo, output: &PortInfo, sink: TransportSink) -> Result<()> {
        self.connect_output(output)?;
        if let Err(err) = self.connect_input(input, sink) {
            self.close();
            return Err(err);
        }
        tracing::debug!(input = %input.name, output = %output.name, "midir transport opened");
        Ok(())
    }

    fn close(&self) {
        // Dropped outside the locks: closing the input joins its thread,
        // which may be waiting on the output lock.
        let input = self.input.lock().take();
        drop(input);
        let output = self.output.lock().take();
        drop(output);
    }

    fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut output = self.output.lock();
        let connection = output.as_mut().ok_or(MidiError::NotOpen)?;
        connection.send(bytes).map_err(backend_error)
    }

    fn is_open(&self) -> bool {
        self.input.lock().is_some() && self.output.lock().is_some()
    }
}

impl Drop for MidirTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn backend_error(err: impl std::fmt::Display) -> MidiError {
    MidiError::Backend(err.to_string())
}
