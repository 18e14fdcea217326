//! Smallest-three quaternion compression into 32 bits.
//!
//! The component with the largest absolute value is dropped and its index stored in the top two
//!  bits. The other three lie in [-1/√2, 1/√2] and are quantized to 10 bits each. If the dropped
//!  component was negative, the whole quaternion is negated first (q and -q are the same
//!  rotation), so decompression always reconstructs a non-negative dropped component. Callers that
//!  compare quaternions component-wise must allow for that sign flip.

use glam::Quat;

const MINIMUM: f32 = -1.0 / 1.414214;
const MAXIMUM: f32 = 1.0 / 1.414214;
const RANGE: f32 = MAXIMUM - MINIMUM;

const BITS_PER_COMPONENT: u32 = 10;
const MAX_QUANTIZED: u32 = (1 << BITS_PER_COMPONENT) - 1;

pub fn compress_rotation(rotation: Quat) -> u32 {
    let components = rotation.to_array();

    let mut largest = 0;
    for i in 1..4 {
        if components[i].abs() > components[largest].abs() {
            largest = i;
        }
    }

    let sign = if components[largest] >= 0.0 { 1.0 } else { -1.0 };

    let mut result = (largest as u32) << 30;
    let mut slot = 0;
    for (i, &component) in components.iter().enumerate() {
        if i == largest {
            continue;
        }
        let shift = BITS_PER_COMPONENT * (2 - slot);
        result |= quantize(component * sign) << shift;
        slot += 1;
    }
    result
}

pub fn decompress_rotation(compressed: u32) -> Quat {
    let largest = (compressed >> 30) as usize;

    let a = dequantize((compressed >> 20) & MAX_QUANTIZED);
    let b = dequantize((compressed >> 10) & MAX_QUANTIZED);
    let c = dequantize(compressed & MAX_QUANTIZED);

    // quantization can push the sum of squares slightly above 1
    let dropped = (1.0 - a*a - b*b - c*c).max(0.0).sqrt();

    let mut components = [0.0f32; 4];
    let mut others = [a, b, c].into_iter();
    for (i, component) in components.iter_mut().enumerate() {
        *component = if i == largest {
            dropped
        }
        else {
            others.next().unwrap_or_default()
        };
    }
    Quat::from_array(components)
}

fn quantize(value: f32) -> u32 {
    let normalized = (value - MINIMUM) / RANGE;
    // 1/√2 itself would round to 1024, which does not fit into 10 bits
    let quantized = (normalized * 1024.0 + 0.5).floor();
    quantized.clamp(0.0, MAX_QUANTIZED as f32) as u32
}

fn dequantize(quantized: u32) -> f32 {
    quantized as f32 / 1024.0 * RANGE + MINIMUM
}
