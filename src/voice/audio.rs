//! PCM16/WAV framing and the base64 codec at the WebSocket boundary.
//!
//! Adapters hand back either raw PCM16 or pre-framed WAV; the core's job is
//! to normalize both into independently playable WAV chunks (spec §4.12).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

/// Wrap raw PCM16 mono samples in a RIFF/WAVE header.
pub fn pcm16_to_wav_bytes(pcm: &[u8], sample_rate: u32, channels: u16) -> Vec<u8> {
    let mut cursor = std::io::Cursor::new(Vec::with_capacity(44 + pcm.len()));
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("valid wav spec");
        for chunk in pcm.chunks_exact(2) {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
            writer.write_sample(sample).expect("writing to in-memory buffer cannot fail");
        }
        writer.finalize().expect("finalizing in-memory wav cannot fail");
    }
    cursor.into_inner()
}

pub fn encode_wav_to_b64(wav_bytes: &[u8]) -> String {
    BASE64.encode(wav_bytes)
}

pub fn decode_b64_to_bytes(b64: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(b64)
}

/// Cheap sniff for "this payload looks like a RIFF/WAVE container".
pub fn is_wav_bytes(payload: &[u8]) -> bool {
    payload.len() >= 12 && &payload[0..4] == b"RIFF" && &payload[8..12] == b"WAVE"
}

/// Read the declared sample rate out of a WAV header (bytes 24..28, little
/// endian); `None` if the payload isn't a WAV or the rate is zero/unreadable.
pub fn extract_wav_sample_rate(payload: &[u8]) -> Option<u32> {
    if !is_wav_bytes(payload) || payload.len() < 28 {
        return None;
    }
    let sample_rate = u32::from_le_bytes([payload[24], payload[25], payload[26], payload[27]]);
    if sample_rate == 0 {
        None
    } else {
        Some(sample_rate)
    }
}

/// Some TTS adapters (GPT-SoVITS-style streaming) open with a header-only
/// 44-byte RIFF frame (`riff_size=36`, `data_size=0`) before raw PCM.
/// Stripping is idempotent: a payload with no such header is returned as-is.
pub fn strip_empty_wav_header_prefix(payload: &[u8]) -> (&[u8], bool) {
    if !is_wav_bytes(payload) || payload.len() < 44 {
        return (payload, false);
    }
    let riff_size = u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
    let data_size = u32::from_le_bytes([payload[40], payload[41], payload[42], payload[43]]);
    if riff_size == 36 && data_size == 0 {
        (&payload[44..], true)
    } else {
        (payload, false)
    }
}

/// Normalize one inbound adapter chunk into an independently playable WAV
/// payload, returning `(wav_chunk, pcm_carry)`. `wav_chunk` is empty when
/// there wasn't enough data yet (e.g. an odd trailing byte, or a
/// header-only frame that stripped to nothing); `pcm_carry` must be passed
/// back in on the next call for the same segment.
pub fn to_playable_wav_chunk(
    chunk: &[u8],
    sample_rate: u32,
    channels: u16,
    pcm_carry: &[u8],
) -> (Vec<u8>, Vec<u8>) {
    if chunk.is_empty() {
        return (Vec::new(), pcm_carry.to_vec());
    }

    let (normalized, stripped_empty_header) = strip_empty_wav_header_prefix(chunk);
    if stripped_empty_header {
        if normalized.is_empty() {
            return (Vec::new(), Vec::new());
        }
        return pcm_to_wav_with_carry(normalized, sample_rate, channels, &[]);
    }
    if is_wav_bytes(chunk) {
        return (chunk.to_vec(), Vec::new());
    }

    pcm_to_wav_with_carry(chunk, sample_rate, channels, pcm_carry)
}

fn pcm_to_wav_with_carry(
    chunk: &[u8],
    sample_rate: u32,
    channels: u16,
    pcm_carry: &[u8],
) -> (Vec<u8>, Vec<u8>) {
    let mut pcm = Vec::with_capacity(pcm_carry.len() + chunk.len());
    pcm.extend_from_slice(pcm_carry);
    pcm.extend_from_slice(chunk);

    if pcm.len() < 2 {
        return (Vec::new(), pcm);
    }

    let next_carry = if pcm.len() % 2 == 1 {
        let tail = pcm.split_off(pcm.len() - 1);
        tail
    } else {
        Vec::new()
    };

    if pcm.is_empty() {
        return (Vec::new(), next_carry);
    }

    (pcm16_to_wav_bytes(&pcm, sample_rate, channels), next_carry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_round_trips_through_wav_sample_rate() {
        let pcm = vec![0u8; 320];
        let wav = pcm16_to_wav_bytes(&pcm, 24_000, 1);
        assert_eq!(extract_wav_sample_rate(&wav), Some(24_000));
    }

    #[test]
    fn empty_header_strip_is_idempotent() {
        let mut header = vec![0u8; 44];
        header[0..4].copy_from_slice(b"RIFF");
        header[4..8].copy_from_slice(&36u32.to_le_bytes());
        header[8..12].copy_from_slice(b"WAVE");
        header[40..44].copy_from_slice(&0u32.to_le_bytes());

        let (once, stripped1) = strip_empty_wav_header_prefix(&header);
        assert!(stripped1);
        assert!(once.is_empty());

        let (twice, stripped2) = strip_empty_wav_header_prefix(once);
        assert!(!stripped2);
        assert_eq!(twice, once);
    }

    #[test]
    fn odd_trailing_byte_carries_to_next_chunk() {
        let first = vec![1u8, 2, 3];
        let (wav1, carry) = to_playable_wav_chunk(&first, 16_000, 1, &[]);
        assert!(!wav1.is_empty());
        assert_eq!(carry, vec![3u8]);

        let second = vec![4u8, 5];
        let (wav2, carry2) = to_playable_wav_chunk(&second, 16_000, 1, &carry);
        assert!(!wav2.is_empty());
        assert!(carry2.is_empty());
    }

    #[test]
    fn base64_round_trip() {
        let data = vec![9u8, 8, 7, 6];
        let encoded = encode_wav_to_b64(&data);
        let decoded = decode_b64_to_bytes(&encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn already_wav_chunk_passes_through() {
        let wav = pcm16_to_wav_bytes(&[1, 2, 3, 4], 16_000, 1);
        let (out, carry) = to_playable_wav_chunk(&wav, 16_000, 1, &[]);
        assert_eq!(out, wav);
        assert!(carry.is_empty());
    }
}
