use app_config::AppConfig;

#[test]
fn test_load_config_defaults() {
    let config = AppConfig::load().expect("Failed to load config");
    assert_eq!(config.db_port, 5432);
    assert_eq!(config.kafka_topic, "payment-events");
    assert_eq!(config.order_currency, "EUR");
}
