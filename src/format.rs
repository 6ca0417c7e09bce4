//! Message text for chat notifications.
//!
//! Every accessor tolerates missing telemetry: an absent field renders as an
//! empty string, never as an error.

use chrono::{DateTime, Local};

use crate::status::{HOST_SENSOR, KlippyState, MCU_SENSOR, PrinterInfo, PrinterStatus};

/// Render the status message for `info` and `status` as of `now`.
pub fn format_message(info: &PrinterInfo, status: &PrinterStatus, now: DateTime<Local>) -> String {
    let mut text = String::new();

    match info.state {
        KlippyState::Ready if status.is_printing() => {
            text.push_str(&format!(
                "Printing: {}\n",
                status.filename().unwrap_or_default()
            ));
            text.push_str(&format!(
                "Duration: {} Est: {}\n",
                duration_field(status, "print_duration"),
                duration_field(status, "total_duration"),
            ));
            text.push_str(&format!(
                "M117 {}\n",
                status.display_message().unwrap_or_default()
            ));
            text.push_str(&format!(
                "Progress {}%, height: {}mm\n",
                progress(status),
                status.z_position().map(|z| format!("{z:.2}")).unwrap_or_default(),
            ));
            text.push_str(&format!("Filament: {}cm,\n", filament_cm(status)));
            text.push_str(&heater_line(status, "♨️ Heater Bed", "heater_bed"));
            text.push_str(&heater_line(status, "♨️ Extruder", "extruder"));
            text.push_str(&sensor_line(status, "🌡️ CPU Temp", HOST_SENSOR));
            text.push_str(&sensor_line(status, "🌡️ Mcu Temp", MCU_SENSOR));
        }
        KlippyState::Ready => {
            // Shown as the backend spells it.
            text.push_str(&format!(
                "Printer status: {}\n",
                status.str_field("print_stats", "state").unwrap_or_default()
            ));
        }
        KlippyState::Shutdown => {
            text.push_str(&format!("Printer status: {}\n", info.state.as_str()));
            text.push_str(&format!("{}\n", info.state_message));
        }
        _ => {}
    }

    text.push_str(&format!(
        "Last update at {}",
        now.format("%Y-%m-%d %H:%M:%S")
    ));
    text
}

/// Format seconds as `h:mm:ss`, prefixed by a day count past 24 hours.
pub fn format_duration(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds as u64
    } else {
        0
    };
    let (minutes, secs) = (total / 60, total % 60);
    let (hours, minutes) = (minutes / 60, minutes % 60);

    if total > 86_400 {
        format!("{}d {}:{minutes:02}:{secs:02}", hours / 24, hours % 24)
    } else {
        format!("{hours}:{minutes:02}:{secs:02}")
    }
}

fn duration_field(status: &PrinterStatus, field: &str) -> String {
    status
        .f64_field("print_stats", field)
        .map(format_duration)
        .unwrap_or_default()
}

fn progress(status: &PrinterStatus) -> String {
    status
        .f64_field("display_status", "progress")
        .map(|p| format!("{}", (p * 100.0).round().clamp(0.0, 100.0)))
        .unwrap_or_default()
}

fn filament_cm(status: &PrinterStatus) -> String {
    status
        .f64_field("print_stats", "filament_used")
        .map(|mm| format!("{}", (mm / 10.0).round()))
        .unwrap_or_default()
}

fn temperature(status: &PrinterStatus, object: &str) -> String {
    status
        .f64_field(object, "temperature")
        .map(|t| format!("{t:.1}"))
        .unwrap_or_default()
}

fn heater_line(status: &PrinterStatus, label: &str, object: &str) -> String {
    let heating = status.f64_field(object, "power").is_some_and(|p| p > 0.0);
    format!(
        "{label}: {} °C {}\n",
        temperature(status, object),
        if heating { "🔥" } else { "" }
    )
}

fn sensor_line(status: &PrinterStatus, label: &str, object: &str) -> String {
    format!("{label}: {} °C\n", temperature(status, object))
}
