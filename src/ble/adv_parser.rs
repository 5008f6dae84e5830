//! Walkers over raw advertisement data (sequences of AD structures:
//! `[len][type][len - 1 bytes of data]`).

use heapless::String;

/// AD type: Shortened Local Name.
pub const AD_TYPE_SHORT_NAME: u8 = 0x08;
/// AD type: Complete Local Name.
pub const AD_TYPE_COMPLETE_NAME: u8 = 0x09;
/// AD type: Manufacturer Specific Data.
pub const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

/// Iterate `(ad_type, data)` pairs, stopping at the first malformed entry.
pub fn ad_structures(data: &[u8]) -> impl Iterator<Item = (u8, &[u8])> {
    let mut i = 0;
    core::iter::from_fn(move || {
        if i >= data.len() {
            return None;
        }
        let len = data[i] as usize;
        if len == 0 || i + len >= data.len() {
            return None;
        }
        let ad_type = data[i + 1];
        let body = &data[i + 2..i + 1 + len];
        i += len + 1;
        Some((ad_type, body))
    })
}

/// Extract complete/shortened local name from advertisement data.
pub fn extract_device_name(data: &[u8]) -> Option<String<32>> {
    let (_, name_bytes) = ad_structures(data)
        .find(|(ad_type, _)| *ad_type == AD_TYPE_SHORT_NAME || *ad_type == AD_TYPE_COMPLETE_NAME)?;

    let mut name = String::new();
    for &b in name_bytes {
        if name.push(b as char).is_err() {
            break;
        }
    }
    Some(name)
}

/// True if the advertised local name equals `expected`.
pub fn name_matches(data: &[u8], expected: &str) -> bool {
    extract_device_name(data).is_some_and(|name| name.as_str() == expected)
}

/// Body of the first manufacturer-specific AD carrying `company_id`,
/// with the company id stripped.
pub fn find_manufacturer_data(data: &[u8], company_id: u16) -> Option<&[u8]> {
    let company_le = company_id.to_le_bytes();
    ad_structures(data).find_map(|(ad_type, body)| {
        (ad_type == AD_TYPE_MANUFACTURER_DATA && body.len() >= 2 && body[..2] == company_le)
            .then(|| &body[2..])
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_complete_local_name() {
        let ad_data = [
            0x04, 0x09, // len=4, type=0x09
            b'P', b'R', b'X',
        ];
        let name = extract_device_name(&ad_data).unwrap();
        assert_eq!(name.as_str(), "PRX");
        assert!(name_matches(&ad_data, "PRX"));
    }

    #[test]
    fn extract_shortened_local_name_after_flags() {
        let ad_data = [
            0x02, 0x01, 0x06, // Flags: LE General Discoverable
            0x03, 0x08, b'P', b'R',
        ];
        assert_eq!(extract_device_name(&ad_data).unwrap().as_str(), "PR");
        assert!(!name_matches(&ad_data, "PRX"));
    }

    #[test]
    fn no_name_in_advertisement() {
        let ad_data = [0x02, 0x01, 0x06];
        assert!(extract_device_name(&ad_data).is_none());
        assert!(!name_matches(&ad_data, "PRX"));
    }

    #[test]
    fn name_truncated_to_32_chars() {
        let mut ad_data = [0u8; 40];
        ad_data[0] = 35;
        ad_data[1] = 0x09;
        for b in ad_data.iter_mut().take(37).skip(2) {
            *b = b'X';
        }
        let name = extract_device_name(&ad_data).unwrap();
        assert_eq!(name.len(), 32);
    }

    #[test]
    fn malformed_lengths_stop_the_walk() {
        assert_eq!(ad_structures(&[0x00]).count(), 0);
        assert_eq!(ad_structures(&[0x05, 0x09, b'P']).count(), 0);
        assert_eq!(ad_structures(&[]).count(), 0);

        // A valid entry followed by a truncated one yields only the first.
        let ad_data = [0x02, 0x01, 0x06, 0x09, 0xFF, 0x01];
        let found: Vec<_> = ad_structures(&ad_data).collect();
        assert_eq!(found, vec![(0x01u8, &[0x06u8][..])]);
    }

    #[test]
    fn manufacturer_data_matched_by_company() {
        let ad_data = [
            0x05, 0xFF, 0x59, 0x00, 0xAA, 0xBB, // Nordic, ignored
            0x05, 0xFF, 0xFF, 0x02, 0x01, 0x02, // Silicon Labs
        ];
        assert_eq!(find_manufacturer_data(&ad_data, 0x02FF), Some(&[0x01, 0x02][..]));
        assert_eq!(find_manufacturer_data(&ad_data, 0x0059), Some(&[0xAA, 0xBB][..]));
        assert_eq!(find_manufacturer_data(&ad_data, 0x004C), None);
    }
}
