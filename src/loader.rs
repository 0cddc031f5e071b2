// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! WAV file loading for trigger slots.
//!
//! Files are decoded entirely into memory — clip launching needs
//! zero-latency access to every sample. When the file's rate differs from
//! the engine rate, the audio is resampled at load time so the realtime path
//! never converts.

use std::path::Path;

use hound::{SampleFormat, WavReader};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::{debug, info};

use crate::region::{MemoryRegion, RegionId};

/// Input block size for the sinc resampler.
const RESAMPLE_CHUNK: usize = 1024;

/// Errors raised while loading a clip from disk.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),

    #[error("unsupported wav format: {0}")]
    UnsupportedFormat(String),

    #[error("file has no audio frames")]
    Empty,

    #[error("resampler construction failed: {0}")]
    ResamplerConstruction(#[from] rubato::ResamplerConstructionError),

    #[error("resampling failed: {0}")]
    Resample(#[from] rubato::ResampleError),
}

/// Loads a WAV file into a [`MemoryRegion`] at `target_rate`.
///
/// The region id defaults to the file path; pass `id` to override (for
/// example when reloading persisted state that already names the region).
pub fn load_wav_region(
    path: &Path,
    id: Option<RegionId>,
    target_rate: u32,
) -> Result<MemoryRegion, LoaderError> {
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();
    let n_channels = spec.channels as usize;
    if n_channels == 0 {
        return Err(LoaderError::UnsupportedFormat("zero channels".to_string()));
    }

    info!(
        path = %path.display(),
        channels = n_channels,
        sample_rate = spec.sample_rate,
        bits = spec.bits_per_sample,
        "Loading clip"
    );

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<Vec<f32>, hound::Error>>()?,
        SampleFormat::Int => {
            // Integer samples come back sign-extended in an i32; normalize
            // by the format's own full scale.
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|s| s as f32 / scale))
                .collect::<Result<Vec<f32>, hound::Error>>()?
        }
    };

    if interleaved.is_empty() {
        return Err(LoaderError::Empty);
    }

    // Deinterleave to the planar layout the engine plays from.
    let frames = interleaved.len() / n_channels;
    let mut channels = vec![Vec::with_capacity(frames); n_channels];
    for frame in 0..frames {
        for (ch, buf) in channels.iter_mut().enumerate() {
            buf.push(interleaved[frame * n_channels + ch]);
        }
    }

    if spec.sample_rate != target_rate {
        debug!(
            from = spec.sample_rate,
            to = target_rate,
            "Resampling clip to engine rate"
        );
        channels = resample_planar(&channels, spec.sample_rate, target_rate)?;
    }

    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("clip")
        .to_string();
    let id = id.unwrap_or_else(|| RegionId::new(path.to_string_lossy().into_owned()));

    Ok(MemoryRegion::new(id, name, channels))
}

/// Resamples planar audio from `from_rate` to `to_rate` with a sinc
/// interpolator.
fn resample_planar(
    channels: &[Vec<f32>],
    from_rate: u32,
    to_rate: u32,
) -> Result<Vec<Vec<f32>>, LoaderError> {
    let nchans = channels.len();
    let in_len = channels.first().map(Vec::len).unwrap_or(0);
    let ratio = to_rate as f64 / from_rate as f64;

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLE_CHUNK, nchans)?;

    let mut out: Vec<Vec<f32>> = vec![Vec::with_capacity((in_len as f64 * ratio) as usize); nchans];
    let mut pos = 0;

    while pos < in_len {
        let need = resampler.input_frames_next();
        if in_len - pos >= need {
            let input: Vec<&[f32]> = channels.iter().map(|ch| &ch[pos..pos + need]).collect();
            let produced = resampler.process(&input, None)?;
            for (o, p) in out.iter_mut().zip(produced) {
                o.extend_from_slice(&p);
            }
            pos += need;
        } else {
            // Final partial chunk.
            let input: Vec<&[f32]> = channels.iter().map(|ch| &ch[pos..]).collect();
            let produced = resampler.process_partial(Some(&input), None)?;
            for (o, p) in out.iter_mut().zip(produced) {
                o.extend_from_slice(&p);
            }
            pos = in_len;
        }
    }

    // Flush whatever the sinc window still holds.
    let produced = resampler.process_partial::<&[f32]>(None, None)?;
    for (o, p) in out.iter_mut().zip(produced) {
        o.extend_from_slice(&p);
    }

    Ok(out)
}
