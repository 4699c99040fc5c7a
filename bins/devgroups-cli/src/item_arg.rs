//! Parses a `<tag>=<value>` CLI argument into a wire [`Item`].
//!
//! `tag` may be a known item name (`power`, `light_bri`, ...) or a bare
//! numeric tag. `value` is parsed according to the tag's width class.

use devgroups::error::{Error, Result};
use devgroups::wire::{width_of, DgrItem, Item, Value, Width};

fn tag_by_name(name: &str) -> Option<u8> {
    Some(match name {
        "status" => DgrItem::STATUS,
        "flags" => DgrItem::FLAGS,
        "light_fade" => DgrItem::LIGHT_FADE,
        "light_speed" => DgrItem::LIGHT_SPEED,
        "light_bri" => DgrItem::LIGHT_BRI,
        "light_scheme" => DgrItem::LIGHT_SCHEME,
        "light_fixed_color" => DgrItem::LIGHT_FIXED_COLOR,
        "bri_preset_low" => DgrItem::BRI_PRESET_LOW,
        "bri_preset_high" => DgrItem::BRI_PRESET_HIGH,
        "bri_power_on" => DgrItem::BRI_POWER_ON,
        "power" => DgrItem::POWER,
        "no_status_share" => DgrItem::NO_STATUS_SHARE,
        "event" => DgrItem::EVENT,
        "command" => DgrItem::COMMAND,
        "light_channels" => DgrItem::LIGHT_CHANNELS,
        _ => return None,
    })
}

/// Parse one `tag=value` argument.
pub fn parse(arg: &str) -> Result<Item> {
    let (name, value) = arg
        .split_once('=')
        .ok_or_else(|| Error::Parse(format!("expected <tag>=<value>, got {arg:?}")))?;

    let tag = match tag_by_name(name) {
        Some(t) => t,
        None => name
            .parse::<u8>()
            .map_err(|_| Error::Parse(format!("unknown item tag {name:?}")))?,
    };

    let parsed = match width_of(tag) {
        Width::Eol => {
            return Err(Error::Parse(
                "tag 0 is the stream terminator, not a real item".to_string(),
            ))
        }
        Width::U8 => Value::U8(value.parse().map_err(|_| {
            Error::Parse(format!("{value:?} is not a valid u8 for tag {tag}"))
        })?),
        Width::U16 => Value::U16(value.parse().map_err(|_| {
            Error::Parse(format!("{value:?} is not a valid u16 for tag {tag}"))
        })?),
        Width::U32 => Value::U32(value.parse().map_err(|_| {
            Error::Parse(format!("{value:?} is not a valid u32 for tag {tag}"))
        })?),
        Width::Str => {
            if value.len() > 255 {
                return Err(Error::ItemTooLarge {
                    tag,
                    len: value.len(),
                });
            }
            Value::Str(value.to_string())
        }
        Width::Opaque => {
            if value.len() > 255 {
                return Err(Error::ItemTooLarge {
                    tag,
                    len: value.len(),
                });
            }
            Value::Opaque(value.as_bytes().to_vec())
        }
    };

    Ok(Item::new(tag, parsed))
}
