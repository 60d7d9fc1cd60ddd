//! Incremental region decoding.
//!
//! A [`RegionDecompressor`] derives the decode parameters for one request,
//! starts an engine session and hands decoded rectangles back to the caller
//! one `process` call at a time.

use tracing::{debug, error, info_span, trace, warn};

use crate::context::ThreadEnv;
use crate::engine::{EngineSession, StartRequest};
use crate::error::{ABORTED_CODE, DecodeError};
use crate::image::ImageHandle;
use crate::params::DecodeParameters;
use crate::{Coords, Region};

/// Upper bound on samples the engine produces per `process` call.
pub const PROCESS_BLOCK_SAMPLES: usize = 128 * 1024;

/// What one `process` call delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Processed {
    /// Rectangle written to the buffer, relative to the output origin.
    pub region: Region,
    /// Whether part of the output has not been delivered yet.
    pub more_pending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Processing,
    Complete,
    Failed,
}

/// One region decode in progress.
///
/// Dropping a decompressor without calling [`RegionDecompressor::finish`]
/// still releases the engine session.
pub struct RegionDecompressor<'a> {
    session: Option<Box<dyn EngineSession + 'a>>,
    params: DecodeParameters,
    incomplete: Region,
    state: State,
    /// Code of a fault the engine reported from `process`.
    fault: Option<i32>,
    /// Private pool, when the strategy asks for one per session.
    _threads: Option<ThreadEnv>,
    span: tracing::Span,
}

impl<'a> RegionDecompressor<'a> {
    pub(crate) fn start(
        handle: &'a ImageHandle,
        region: Region,
        scaled: Option<(u32, u32)>,
    ) -> Result<Self, DecodeError> {
        let info = handle.info();
        let context = handle.context();
        let strategy = context.strategy();
        let clipped = region.intersect(&info.bounds());

        let span = info_span!(parent: handle.span(), "decompress", region = ?clipped);
        let entered = span.enter();

        let params = match scaled {
            None => DecodeParameters::native(clipped),
            Some((width, height)) => DecodeParameters::derive_with(
                clipped,
                width,
                height,
                info.dwt_levels,
                strategy.discard,
                |level| {
                    context
                        .engine()
                        .expansion_limits(handle.codestream(), handle.channels(), level)
                },
            ),
        };
        let output = Region::new(0, 0, params.output_size.x, params.output_size.y);

        if output.is_empty() {
            debug!("nothing to decode");
            drop(entered);
            return Ok(Self {
                session: None,
                params,
                incomplete: Region::default(),
                state: State::Complete,
                fault: None,
                _threads: None,
                span,
            });
        }

        let threads = context.session_threads()?;
        debug!(
            discard_level = params.discard_level,
            numerator = ?params.expand_numerator,
            denominator = ?params.expand_denominator,
            output = ?params.output_size,
            threads = ?threads.as_ref().map(ThreadEnv::threads),
            "starting region decode"
        );

        let session = context.engine().start(StartRequest {
            codestream: handle.codestream(),
            source: handle.source(),
            channels: handle.channels(),
            discard_level: params.discard_level,
            block_budget: PROCESS_BLOCK_SAMPLES,
            render_dims: params.render_dims,
            output_size: params.output_size,
            numerator: params.expand_numerator,
            denominator: params.expand_denominator,
            precise: strategy.precise,
            fastest: strategy.fastest,
            threads: threads.clone(),
            memory: context.memory().clone(),
        })?;

        drop(entered);
        Ok(Self {
            session: Some(session),
            params,
            incomplete: output,
            state: State::Processing,
            fault: None,
            _threads: threads,
            span,
        })
    }

    pub fn params(&self) -> &DecodeParameters {
        &self.params
    }

    pub fn output_size(&self) -> Coords {
        self.params.output_size
    }

    /// The part of the output not yet delivered.
    pub fn incomplete_region(&self) -> Region {
        self.incomplete
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    /// Decodes the next part of the region into `buffer`.
    ///
    /// Samples are written one packed word per pixel, rows `region.width`
    /// words apart. Once the region is complete further calls return an
    /// empty rectangle with `more_pending` unset.
    pub fn process(&mut self, buffer: &mut [i32]) -> Result<Processed, DecodeError> {
        let process_span = info_span!(parent: &self.span, "process", buffer = buffer.len());
        let _entered = process_span.enter();

        match self.state {
            State::Complete => return Ok(Processed::default()),
            State::Failed => {
                return Err(DecodeError::CodecFault {
                    code: self.fault.unwrap_or(ABORTED_CODE),
                });
            }
            State::Processing => {}
        }
        let Some(session) = self.session.as_mut() else {
            self.state = State::Complete;
            return Ok(Processed::default());
        };

        let mut remaining = self.incomplete;
        let produced = match session.process(buffer, &mut remaining) {
            Ok(produced) => produced,
            Err(err) => {
                if let DecodeError::CodecFault { code } = err {
                    self.fault = Some(code);
                }
                error!(%err, "region decode failed");
                self.state = State::Failed;
                return Err(err);
            }
        };

        if !self.incomplete.contains(&produced)
            || !self.incomplete.contains(&remaining)
            || produced.area() > buffer.len() as u64
        {
            self.state = State::Failed;
            return Err(DecodeError::ContractViolation(format!(
                "engine produced {produced:?} leaving {remaining:?} from {:?} with a {} sample buffer",
                self.incomplete,
                buffer.len()
            )));
        }

        self.incomplete = remaining;
        let more_pending = !remaining.is_empty();
        if !more_pending {
            self.state = State::Complete;
            debug!("region complete");
        }
        trace!(?produced, ?remaining, "processed");
        Ok(Processed {
            region: produced,
            more_pending,
        })
    }

    /// Ends the decode and reports its outcome.
    ///
    /// A session that failed reports a [`DecodeError::CodecFault`] carrying
    /// the engine's code, or [`ABORTED_CODE`] if the engine had none.
    pub fn finish(mut self) -> Result<(), DecodeError> {
        let code = self.finish_session();
        let _entered = self.span.enter();
        match (self.state, self.fault) {
            (State::Failed, Some(fault)) => Err(DecodeError::CodecFault { code: fault }),
            (State::Failed, None) if code != 0 => Err(DecodeError::CodecFault { code }),
            (State::Failed, None) => Err(DecodeError::CodecFault { code: ABORTED_CODE }),
            (_, _) if code != 0 => {
                error!(code, "engine reported a fault at finish");
                Err(DecodeError::CodecFault { code })
            }
            _ => Ok(()),
        }
    }

    /// Finishes the engine session if it is still live; returns its code.
    fn finish_session(&mut self) -> i32 {
        match self.session.take() {
            Some(mut session) => session.finish(),
            None => 0,
        }
    }
}

impl Drop for RegionDecompressor<'_> {
    fn drop(&mut self) {
        if self.session.is_some() {
            let span = self.span.clone();
            let _entered = span.enter();
            warn!(
                incomplete = ?self.incomplete,
                "decompressor dropped without finish"
            );
            let code = self.finish_session();
            if code != 0 {
                debug!(code, "abandoned session finished with a fault");
            }
        }
    }
}
