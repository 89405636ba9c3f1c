mod tests_corruption;
mod tests_roundtrip;
mod tests_streaming;
