/// Emit a single machine-readable stat line on stdout.
///
/// Only active with the `stats` cargo feature. The output format is
/// `NAME value[,value..],unix_millis`, one line per sample, intended for
/// offline plotting of estimator behavior.
#[cfg(feature = "stats")]
macro_rules! log_stat {
    ($name:expr, $($arg:expr),+) => {
        {
            use std::time::SystemTime;
            use std::io::{self, Write};

            let since_epoch = SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default();
            let unix_time_ms = since_epoch.as_millis();
            let mut lock = io::stdout().lock();
            let _ = write!(lock, "{} ", $name);
            $(
                let _ = write!(lock, "{},", $arg);
            )+
            let _ = writeln!(lock, "{}", unix_time_ms);
        }
    };
}

#[cfg(not(feature = "stats"))]
macro_rules! log_stat {
    ($name:expr, $($arg:expr),+) => {
        {
            let _ = &$name;
            $(
                let _ = &$arg;
            )+
        }
    };
}

macro_rules! log_delay_variation {
    ($($arg:expr),+) => {
        log_stat!("DELAY_VARIATION", $($arg),+);
    }
}

macro_rules! log_trendline_estimate {
    ($($arg:expr),+) => {
        log_stat!("TRENDLINE_ESTIMATE", $($arg),+);
    }
}

macro_rules! log_trendline_modified_trend {
    ($($arg:expr),+) => {
        log_stat!("TRENDLINE_MODIFIED_TREND", $($arg),+);
    }
}

macro_rules! log_bitrate_estimate {
    ($($arg:expr),+) => {
        log_stat!("BITRATE_ESTIMATE", $($arg),+);
    }
}

macro_rules! log_loss_based_estimate {
    ($($arg:expr),+) => {
        log_stat!("LOSS_BITRATE_ESTIMATE", $($arg),+);
    }
}

macro_rules! log_rate_control_state {
    ($($arg:expr),+) => {
        log_stat!("RATE_CONTROL_STATE", $($arg),+);
    }
}

macro_rules! log_rate_control_applied_change {
    ($($arg:expr),+) => {
        log_stat!("RATE_CONTROL_APPLIED_CHANGE", $($arg),+);
    }
}

macro_rules! log_pacer_media_budget {
    ($($arg:expr),+) => {
        log_stat!("PACER_BUDGET", $($arg),+, "media");
    }
}

macro_rules! log_pacer_padding_budget {
    ($($arg:expr),+) => {
        log_stat!("PACER_BUDGET", $($arg),+, "padding");
    }
}

macro_rules! log_loss {
    ($($arg:expr),+) => {
        log_stat!("LOSS", $($arg),+);
    }
}
