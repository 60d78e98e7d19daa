/// Reads a fixed-width little endian integer through its zerocopy wrapper.
/// This can't be written as a function because the array length
/// has to be known for the concrete wrapper type at the call site.
macro_rules! read_le {
    ($scanner:expr, $type:ty) => {{
        const SIZE: usize = size_of::<$type>();
        let bytes = $scanner.read_array::<SIZE>()?;
        let value: $type = zerocopy::transmute!(bytes);
        value.get()
    }};
}

/// Writes a fixed-width little endian integer through its zerocopy wrapper.
macro_rules! write_le {
    ($writer:expr, $type:ty, $value:expr) => {{
        let value = <$type>::new($value);
        $writer.write_bytes(zerocopy::IntoBytes::as_bytes(&value))
    }};
}
