pub const TOPIC_CONNECT_NEW_WIFI: &str = "connect_new_wifi";
pub const TOPIC_WIFI_CONNECTION_STATUS: &str = "wifi_connection_status";

pub const TOPIC_SCAN_WIFI_NETS: &str = "scan_wifi_nets";
pub const TOPIC_SCAN_WIFI_RESULT: &str = "scan_wifi_result";

pub const TOPIC_LCD_DISPLAY: &str = "LCD_display";
pub const TOPIC_LEDS_TOGGLE: &str = "leds_toggle";

pub const TOPIC_GET_DEVICE_CONNECTION_STATUS: &str = "Get_device_connection_status";
pub const TOPIC_DEVICE_CONNECTION_STATUS: &str = "device_connection_status";
pub const TOPIC_WIFI_CRED_LIST: &str = "wifi_cred_list";
