use tempsensor_common::{portal, AssetSource};

const WIFI_CONFIG_HTML: &str = include_str!("../web/wifi_config.html");
const WIFI_SAVED_HTML: &str = include_str!("../web/wifi_saved.html");

/// Portal pages compiled into the firmware image.
pub struct EmbeddedAssets;

impl AssetSource for EmbeddedAssets {
    fn load_asset(&self, name: &str) -> Option<String> {
        match name {
            portal::FORM_ASSET => Some(WIFI_CONFIG_HTML.to_string()),
            portal::SAVED_ASSET => Some(WIFI_SAVED_HTML.to_string()),
            _ => None,
        }
    }
}
