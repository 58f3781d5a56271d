//! Small AVI files assembled in memory for decode tests.

/// Width of every generated frame. A multiple of 4 keeps BGR rows unpadded.
pub(crate) const FRAME_WIDTH: u32 = 64;
pub(crate) const FRAME_HEIGHT: u32 = 48;
pub(crate) const FRAME_RATE: u32 = 25;

/// Codec tag FFmpeg maps to uncompressed BGR24.
pub(crate) const RAW_BGR: [u8; 4] = [0; 4];
/// Codec tag no FFmpeg decoder claims.
pub(crate) const UNKNOWN_CODEC: [u8; 4] = *b"ZZZ9";

fn chunk(id: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 9);
    out.extend_from_slice(id);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    if payload.len() % 2 == 1 {
        out.push(0);
    }
    out
}

fn list(kind: &[u8; 4], children: &[Vec<u8>]) -> Vec<u8> {
    let mut payload = kind.to_vec();
    for child in children {
        payload.extend_from_slice(child);
    }
    chunk(b"LIST", &payload)
}

fn words(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}

fn frame_pixels(index: u32) -> Vec<u8> {
    let mut pixels = Vec::with_capacity((FRAME_WIDTH * FRAME_HEIGHT * 3) as usize);
    for y in 0..FRAME_HEIGHT {
        for x in 0..FRAME_WIDTH {
            let shade = ((x * 4 + y * 2 + index * 8) % 256) as u8;
            pixels.extend_from_slice(&[shade, 255 - shade, 96]);
        }
    }
    pixels
}

/// An AVI with one video stream of `frames` frames tagged `codec`, with an
/// index so the container declares its duration.
pub(crate) fn avi(codec: [u8; 4], frames: u32) -> Vec<u8> {
    let frame_size = FRAME_WIDTH * FRAME_HEIGHT * 3;

    let avih = words(&[
        1_000_000 / FRAME_RATE,
        frame_size * FRAME_RATE,
        0,
        0x10, // AVIF_HASINDEX
        frames,
        0,
        1,
        frame_size,
        FRAME_WIDTH,
        FRAME_HEIGHT,
        0,
        0,
        0,
        0,
    ]);

    let mut strh = b"vids".to_vec();
    strh.extend_from_slice(&codec);
    strh.extend_from_slice(&words(&[0, 0, 0, 1, FRAME_RATE, 0, frames, frame_size, u32::MAX, 0]));
    strh.extend_from_slice(&[0, 0, 0, 0]);
    strh.extend_from_slice(&(FRAME_WIDTH as u16).to_le_bytes());
    strh.extend_from_slice(&(FRAME_HEIGHT as u16).to_le_bytes());

    let mut strf = words(&[40, FRAME_WIDTH, FRAME_HEIGHT]);
    strf.extend_from_slice(&1u16.to_le_bytes());
    strf.extend_from_slice(&24u16.to_le_bytes());
    strf.extend_from_slice(&codec);
    strf.extend_from_slice(&words(&[frame_size, 0, 0, 0, 0]));

    let hdrl = list(
        b"hdrl",
        &[
            chunk(b"avih", &avih),
            list(b"strl", &[chunk(b"strh", &strh), chunk(b"strf", &strf)]),
        ],
    );

    let mut movi_chunks = Vec::new();
    let mut index = Vec::new();
    // Offsets count from the `movi` list type.
    let mut offset = 4u32;
    for frame in 0..frames {
        let data = chunk(b"00dc", &frame_pixels(frame));
        index.extend_from_slice(b"00dc");
        index.extend_from_slice(&words(&[0x10, offset, frame_size]));
        offset += data.len() as u32;
        movi_chunks.push(data);
    }
    let movi = list(b"movi", &movi_chunks);
    let idx1 = chunk(b"idx1", &index);

    let mut body = b"AVI ".to_vec();
    body.extend_from_slice(&hdrl);
    body.extend_from_slice(&movi);
    body.extend_from_slice(&idx1);
    chunk(b"RIFF", &body)
}
