mod run_encode;
mod test_payloads;
