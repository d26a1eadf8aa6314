// SPDX-License-Identifier: GPL-2.0
//
// inputboostd: which devices to attach to, and which events are power keys.

use evdev::{AbsoluteAxisType, Device, EventType, Key};

use crate::dispatch::BoostKind;

/// Kinds of devices worth watching: multi-touch touchscreens, touchpads,
/// and anything that can emit key events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Touchscreen,
    Touchpad,
    Keys,
}

/// Capability-based attach predicate, evaluated once per device at
/// registration.
pub fn classify_device(dev: &Device) -> Option<DeviceClass> {
    let events = dev.supported_events();

    let (has_mt_position, has_abs_xy) = match dev.supported_absolute_axes() {
        Some(abs) => (
            abs.contains(AbsoluteAxisType::ABS_MT_POSITION_X)
                && abs.contains(AbsoluteAxisType::ABS_MT_POSITION_Y),
            abs.contains(AbsoluteAxisType::ABS_X) && abs.contains(AbsoluteAxisType::ABS_Y),
        ),
        None => (false, false),
    };
    let has_btn_touch = dev
        .supported_keys()
        .map_or(false, |keys| keys.contains(Key::BTN_TOUCH));
    let has_key = events.contains(EventType::KEY);

    classify_capabilities(has_mt_position, has_abs_xy, has_btn_touch, has_key)
}

fn classify_capabilities(
    has_mt_position: bool,
    has_abs_xy: bool,
    has_btn_touch: bool,
    has_key: bool,
) -> Option<DeviceClass> {
    if has_mt_position {
        Some(DeviceClass::Touchscreen)
    } else if has_abs_xy && has_btn_touch {
        Some(DeviceClass::Touchpad)
    } else if has_key {
        Some(DeviceClass::Keys)
    } else {
        None
    }
}

pub fn is_power_key(code: u16) -> bool {
    code == Key::KEY_POWER.code() || code == Key::KEY_WAKEUP.code()
}

/// Power and wake keys get their own queue and duration; everything else
/// is generic input.
pub fn classify_event(event_type: EventType, code: u16) -> BoostKind {
    if event_type == EventType::KEY && is_power_key(code) {
        BoostKind::PowerKey
    } else {
        BoostKind::Generic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touchscreen_wins_over_key_capability() {
        assert_eq!(
            classify_capabilities(true, false, false, true),
            Some(DeviceClass::Touchscreen)
        );
    }

    #[test]
    fn touchpad_needs_touch_button() {
        assert_eq!(
            classify_capabilities(false, true, true, false),
            Some(DeviceClass::Touchpad)
        );
        // Absolute axes alone (e.g. a joystick) are not enough.
        assert_eq!(classify_capabilities(false, true, false, false), None);
    }

    #[test]
    fn key_devices_match() {
        assert_eq!(
            classify_capabilities(false, false, false, true),
            Some(DeviceClass::Keys)
        );
    }

    #[test]
    fn unrelated_devices_are_ignored() {
        assert_eq!(classify_capabilities(false, false, false, false), None);
    }

    #[test]
    fn power_and_wakeup_keys_classify_as_powerkey() {
        assert_eq!(
            classify_event(EventType::KEY, Key::KEY_POWER.code()),
            BoostKind::PowerKey
        );
        assert_eq!(
            classify_event(EventType::KEY, Key::KEY_WAKEUP.code()),
            BoostKind::PowerKey
        );
    }

    #[test]
    fn other_events_classify_as_generic() {
        assert_eq!(
            classify_event(EventType::KEY, Key::KEY_A.code()),
            BoostKind::Generic
        );
        assert_eq!(
            classify_event(EventType::ABSOLUTE, Key::KEY_POWER.code()),
            BoostKind::Generic
        );
        assert_eq!(classify_event(EventType::RELATIVE, 0), BoostKind::Generic);
    }
}
