//! Shared-mode WASAPI stream.
//!
//! Every stream owns a dedicated thread registered with MMCSS. The thread
//! creates and owns all COM objects; the [`WasapiStream`] handle only talks
//! to it over a command channel.

use std::slice;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use windows::core::{w, PCWSTR};
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
use windows::Win32::Media::Audio::*;
use windows::Win32::Media::KernelStreaming::{
    WAVEFORMATEXTENSIBLE, WAVEFORMATEXTENSIBLE_0, WAVE_FORMAT_EXTENSIBLE,
};
use windows::Win32::Media::Multimedia::KSDATAFORMAT_SUBTYPE_IEEE_FLOAT;
use windows::Win32::System::Com::CLSCTX_ALL;
use windows::Win32::System::Threading::{
    AvRevertMmThreadCharacteristics, AvSetMmThreadCharacteristicsW, CreateEventW,
    WaitForSingleObject,
};

use audio_io_core::{
    Direction, EngineError, EngineResult, Latency, NativeFormat, NativeStream, StreamCallbacks,
};

use crate::com::{com_error, ComApartment};
use crate::device_enumerator::EndpointEnumerator;
use crate::format::{frames_to_hns, hns_to_frames};

/// How long `open_stream` waits for the stream thread to initialise the client.
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Wait on the buffer event, in milliseconds. Bounds command latency.
const EVENT_WAIT_MS: u32 = 200;

enum StreamCommand {
    Start(Sender<EngineResult<()>>),
    Stop(Sender<EngineResult<()>>),
}

struct Opened {
    buffer_frames: u32,
    latency: Latency,
}

/// Handle to a stream running on its own thread. Dropping it stops the
/// client and joins the thread.
pub struct WasapiStream {
    commands: Option<Sender<StreamCommand>>,
    buffer_frames: u32,
    latency: Latency,
    thread: Option<thread::JoinHandle<()>>,
}

impl WasapiStream {
    pub(crate) fn open(
        endpoint_id: String,
        direction: Direction,
        format: NativeFormat,
        callbacks: Arc<dyn StreamCallbacks>,
    ) -> EngineResult<Self> {
        let (commands, command_rx) = crossbeam_channel::bounded(1);
        let (opened_tx, opened_rx) = crossbeam_channel::bounded(1);

        let name = match direction {
            Direction::Input => "wasapi-capture",
            Direction::Output => "wasapi-render",
        };
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                stream_thread(endpoint_id, direction, format, callbacks, command_rx, opened_tx)
            })
            .map_err(|e| EngineError::StreamOpenFailure(format!("failed to spawn {}: {}", name, e)))?;

        let opened = match opened_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(result) => result,
            Err(_) => Err(EngineError::StreamOpenFailure(
                "stream thread did not finish initialising".into(),
            )),
        };

        let mut stream = Self {
            commands: Some(commands),
            buffer_frames: 0,
            latency: Latency::default(),
            thread: Some(handle),
        };
        // On failure the handle is dropped here, which joins the thread.
        let opened = opened?;
        stream.buffer_frames = opened.buffer_frames;
        stream.latency = opened.latency;
        Ok(stream)
    }

    fn request(&self, command: fn(Sender<EngineResult<()>>) -> StreamCommand) -> EngineResult<()> {
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| EngineError::InvalidState("stream is closed".into()))?;
        let (reply, reply_rx) = crossbeam_channel::bounded(1);
        commands
            .send(command(reply))
            .map_err(|_| EngineError::Backend("stream thread exited".into()))?;
        reply_rx
            .recv()
            .map_err(|_| EngineError::Backend("stream thread exited".into()))?
    }
}

impl NativeStream for WasapiStream {
    fn start(&mut self) -> EngineResult<()> {
        self.request(StreamCommand::Start)
    }

    fn stop(&mut self) -> EngineResult<()> {
        self.request(StreamCommand::Stop)
    }

    fn frames_per_buffer(&self) -> u32 {
        self.buffer_frames
    }

    fn latency(&self) -> Option<Latency> {
        Some(self.latency)
    }
}

impl Drop for WasapiStream {
    fn drop(&mut self) {
        // Disconnecting the channel ends the thread's command loop.
        self.commands.take();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("WASAPI stream thread panicked");
            }
        }
    }
}

fn stream_thread(
    endpoint_id: String,
    direction: Direction,
    format: NativeFormat,
    callbacks: Arc<dyn StreamCallbacks>,
    commands: Receiver<StreamCommand>,
    opened: Sender<EngineResult<Opened>>,
) {
    let _com = match ComApartment::enter() {
        Ok(com) => com,
        Err(e) => {
            let _ = opened.send(Err(e));
            return;
        }
    };
    let _mmcss = MmcssRegistration::pro_audio();

    let mut client = match StreamClient::open(&endpoint_id, direction, &format) {
        Ok(client) => client,
        Err(e) => {
            log::error!("failed to open WASAPI stream on {}: {}", endpoint_id, e);
            let _ = opened.send(Err(e));
            return;
        }
    };
    let _ = opened.send(Ok(Opened {
        buffer_frames: client.buffer_frames,
        latency: client.latency(),
    }));

    client.serve(&commands, callbacks.as_ref());
    log::debug!("WASAPI stream thread for {} exiting", endpoint_id);
}

enum Transfer {
    Render(IAudioRenderClient),
    Capture(IAudioCaptureClient),
}

/// COM state of one opened stream. Lives only on the stream thread.
struct StreamClient {
    audio_client: IAudioClient,
    transfer: Transfer,
    event: HANDLE,
    buffer_frames: u32,
    block_align: usize,
    stream_latency: u32,
    running: bool,
    primed: bool,
    xruns: u32,
    silence: Vec<u8>,
}

impl StreamClient {
    fn open(endpoint_id: &str, direction: Direction, format: &NativeFormat) -> EngineResult<Self> {
        let enumerator = EndpointEnumerator::new()?;
        let device = enumerator.resolve(endpoint_id)?;
        let audio_client: IAudioClient = unsafe { device.Activate(CLSCTX_ALL, None) }
            .map_err(com_error("IMMDevice::Activate"))?;

        let channels = match direction {
            Direction::Input => format.input_channels,
            Direction::Output => format.output_channels,
        };
        let wave = float_wave_format(channels, format.sample_rate);
        let block_align = wave.Format.nBlockAlign as usize;

        unsafe {
            audio_client
                .Initialize(
                    AUDCLNT_SHAREMODE_SHARED,
                    AUDCLNT_STREAMFLAGS_EVENTCALLBACK
                        | AUDCLNT_STREAMFLAGS_AUTOCONVERTPCM
                        | AUDCLNT_STREAMFLAGS_SRC_DEFAULT_QUALITY
                        | AUDCLNT_STREAMFLAGS_NOPERSIST,
                    frames_to_hns(format.frames, format.sample_rate),
                    0,
                    &wave as *const WAVEFORMATEXTENSIBLE as *const WAVEFORMATEX,
                    None,
                )
                .map_err(|e| {
                    EngineError::StreamOpenFailure(format!("IAudioClient::Initialize failed: {}", e))
                })?;
        }

        let event = unsafe { CreateEventW(None, false, false, PCWSTR::null()) }
            .map_err(com_error("CreateEventW"))?;
        let client = Self::bind(audio_client, direction, event, block_align, format.sample_rate);
        if client.is_err() {
            unsafe {
                let _ = CloseHandle(event);
            }
        }
        let client = client?;

        log::info!(
            "opened WASAPI {:?} stream: {} Hz, {} ch, {} frame buffer",
            direction,
            format.sample_rate,
            channels,
            client.buffer_frames
        );
        Ok(client)
    }

    fn bind(
        audio_client: IAudioClient,
        direction: Direction,
        event: HANDLE,
        block_align: usize,
        sample_rate: u32,
    ) -> EngineResult<Self> {
        unsafe {
            audio_client
                .SetEventHandle(event)
                .map_err(com_error("IAudioClient::SetEventHandle"))?;
            let buffer_frames = audio_client
                .GetBufferSize()
                .map_err(com_error("IAudioClient::GetBufferSize"))?;
            let stream_latency = audio_client.GetStreamLatency().unwrap_or_default();

            let transfer = match direction {
                Direction::Output => Transfer::Render(
                    audio_client
                        .GetService()
                        .map_err(com_error("GetService(IAudioRenderClient)"))?,
                ),
                Direction::Input => Transfer::Capture(
                    audio_client
                        .GetService()
                        .map_err(com_error("GetService(IAudioCaptureClient)"))?,
                ),
            };

            Ok(Self {
                audio_client,
                transfer,
                event,
                buffer_frames,
                block_align,
                stream_latency: hns_to_frames(stream_latency, sample_rate),
                running: false,
                primed: false,
                xruns: 0,
                silence: vec![0; buffer_frames as usize * block_align],
            })
        }
    }

    fn latency(&self) -> Latency {
        let frames = self.stream_latency + self.buffer_frames;
        match self.transfer {
            Transfer::Render(_) => Latency {
                input_frames: 0,
                output_frames: frames,
            },
            Transfer::Capture(_) => Latency {
                input_frames: frames,
                output_frames: 0,
            },
        }
    }

    fn serve(&mut self, commands: &Receiver<StreamCommand>, callbacks: &dyn StreamCallbacks) {
        loop {
            let command = if self.running {
                match commands.try_recv() {
                    Ok(command) => Some(command),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => break,
                }
            } else {
                match commands.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                }
            };

            match command {
                Some(StreamCommand::Start(reply)) => {
                    let result = self.start(callbacks);
                    let _ = reply.send(result);
                    continue;
                }
                Some(StreamCommand::Stop(reply)) => {
                    let _ = reply.send(self.stop(callbacks, 0));
                    continue;
                }
                None => {}
            }

            if unsafe { WaitForSingleObject(self.event, EVENT_WAIT_MS) } != WAIT_OBJECT_0 {
                continue;
            }
            if let Err(e) = self.service(callbacks) {
                log::error!("WASAPI stream failed: {}", e);
                let code = e.code().0;
                let _ = self.stop(callbacks, code);
            }
        }

        if self.running {
            let _ = self.stop(callbacks, 0);
        }
    }

    fn start(&mut self, callbacks: &dyn StreamCallbacks) -> EngineResult<()> {
        if self.running {
            return Ok(());
        }
        unsafe {
            if let Transfer::Render(render) = &self.transfer {
                // Prime with silence so the first period does not read as an underrun.
                render
                    .GetBuffer(self.buffer_frames)
                    .and_then(|_| {
                        render.ReleaseBuffer(self.buffer_frames, AUDCLNT_BUFFERFLAGS_SILENT.0 as u32)
                    })
                    .map_err(com_error("IAudioRenderClient prime"))?;
            }
            self.audio_client
                .Start()
                .map_err(com_error("IAudioClient::Start"))?;
        }
        self.running = true;
        self.primed = true;
        callbacks.on_running(true, 0);
        Ok(())
    }

    fn stop(&mut self, callbacks: &dyn StreamCallbacks, error_code: i32) -> EngineResult<()> {
        if !self.running {
            return Ok(());
        }
        self.running = false;
        self.primed = false;
        let result = unsafe {
            self.audio_client
                .Stop()
                .and_then(|_| self.audio_client.Reset())
                .map_err(com_error("IAudioClient::Stop"))
        };
        callbacks.on_running(false, error_code);
        result
    }

    /// Move every period that is ready. Runs once per buffer event.
    fn service(&mut self, callbacks: &dyn StreamCallbacks) -> windows::core::Result<()> {
        unsafe {
            match &self.transfer {
                Transfer::Render(render) => {
                    let padding = self.audio_client.GetCurrentPadding()?;
                    if padding == 0 && self.primed {
                        callbacks.on_xrun(self.xruns);
                        self.xruns = self.xruns.wrapping_add(1);
                    }
                    let frames = self.buffer_frames.saturating_sub(padding);
                    if frames == 0 {
                        return Ok(());
                    }
                    let data = render.GetBuffer(frames)?;
                    let bytes = slice::from_raw_parts_mut(data, frames as usize * self.block_align);
                    callbacks.on_buffer(&[], &mut [bytes], frames as usize);
                    render.ReleaseBuffer(frames, 0)?;
                }
                Transfer::Capture(capture) => {
                    while capture.GetNextPacketSize()? > 0 {
                        let mut data = std::ptr::null_mut();
                        let mut frames = 0u32;
                        let mut flags = 0u32;
                        capture.GetBuffer(&mut data, &mut frames, &mut flags, None, None)?;

                        if flags & AUDCLNT_BUFFERFLAGS_DATA_DISCONTINUITY.0 as u32 != 0 {
                            callbacks.on_xrun(self.xruns);
                            self.xruns = self.xruns.wrapping_add(1);
                        }

                        let len = frames as usize * self.block_align;
                        if flags & AUDCLNT_BUFFERFLAGS_SILENT.0 as u32 != 0 || data.is_null() {
                            if self.silence.len() < len {
                                self.silence.resize(len, 0);
                            }
                            callbacks.on_buffer(&[&self.silence[..len]], &mut [], frames as usize);
                        } else {
                            let bytes = slice::from_raw_parts(data, len);
                            callbacks.on_buffer(&[bytes], &mut [], frames as usize);
                        }

                        capture.ReleaseBuffer(frames)?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.event);
        }
    }
}

/// Interleaved 32-bit float with no channel mask. `AUTOCONVERTPCM` maps
/// it onto the endpoint's mix format.
fn float_wave_format(channels: u16, sample_rate: u32) -> WAVEFORMATEXTENSIBLE {
    let block_align = channels * 4;
    WAVEFORMATEXTENSIBLE {
        Format: WAVEFORMATEX {
            wFormatTag: WAVE_FORMAT_EXTENSIBLE as u16,
            nChannels: channels,
            nSamplesPerSec: sample_rate,
            nAvgBytesPerSec: sample_rate * block_align as u32,
            nBlockAlign: block_align,
            wBitsPerSample: 32,
            cbSize: (std::mem::size_of::<WAVEFORMATEXTENSIBLE>()
                - std::mem::size_of::<WAVEFORMATEX>()) as u16,
        },
        Samples: WAVEFORMATEXTENSIBLE_0 {
            wValidBitsPerSample: 32,
        },
        dwChannelMask: 0,
        SubFormat: KSDATAFORMAT_SUBTYPE_IEEE_FLOAT,
    }
}

/// Raises the current thread to the MMCSS "Pro Audio" class until dropped.
struct MmcssRegistration(Option<HANDLE>);

impl MmcssRegistration {
    fn pro_audio() -> Self {
        let mut task_index = 0u32;
        match unsafe { AvSetMmThreadCharacteristicsW(w!("Pro Audio"), &mut task_index) } {
            Ok(handle) => Self(Some(handle)),
            Err(e) => {
                log::warn!("MMCSS registration failed, running at normal priority: {}", e);
                Self(None)
            }
        }
    }
}

impl Drop for MmcssRegistration {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            unsafe {
                let _ = AvRevertMmThreadCharacteristics(handle);
            }
        }
    }
}
