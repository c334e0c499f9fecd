//! Default value functions used by serde for config deserialization.

pub fn default_name() -> String {
    "wagate".to_string()
}

pub fn default_data_dir() -> String {
    "~/.wagate".to_string()
}

pub fn default_log_level() -> String {
    "info".to_string()
}

pub fn default_true() -> bool {
    true
}

pub fn default_db_path() -> String {
    "~/.wagate/data/wagate.db".to_string()
}

pub fn default_reconnect_step_ms() -> u64 {
    2_000
}

pub fn default_reconnect_cap_ms() -> u64 {
    60_000
}

pub fn default_fatal_close_codes() -> Vec<u16> {
    vec![401, 403, 411]
}

pub fn default_presence_debounce_ms() -> u64 {
    5_000
}

pub fn default_device_name() -> String {
    "WAGATE".to_string()
}

pub fn default_workers() -> usize {
    10
}

pub fn default_retention_days() -> i64 {
    240
}

pub fn default_per_chat_limit() -> usize {
    10
}

pub fn default_contact_batch_size() -> usize {
    25
}

pub fn default_contact_batch_pause_ms() -> u64 {
    300
}

pub fn default_chat_pause_ms() -> u64 {
    100
}

pub fn default_min_delay_ms() -> u64 {
    300
}

pub fn default_max_delay_ms() -> u64 {
    800
}

pub fn default_typing_ms_per_char() -> u64 {
    40
}

pub fn default_typing_cap_ms() -> u64 {
    5_000
}

pub fn default_media_dir() -> String {
    "~/.wagate/media".to_string()
}

pub fn default_public_base_url() -> String {
    "http://127.0.0.1:8080/media".to_string()
}

pub fn default_download_timeout() -> u64 {
    30
}

pub fn default_webhook_timeout() -> u64 {
    5
}

pub fn default_poll_interval() -> u64 {
    60
}

pub fn default_lookahead_hours() -> i64 {
    24
}

pub fn default_reminder_template() -> String {
    "Olá {name}! Lembrete: {title} em {date} às {time}.".to_string()
}
