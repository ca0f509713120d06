//! Construction macros for documents and values.

/// Builds a [`Bson`](crate::bson::Bson) value from literal-like syntax.
///
/// ```
/// use mongowire::bson::bson;
///
/// let value = bson!({ "ok": 1, "hosts": ["a:27017", "b:27017"] });
/// ```
#[macro_export]
macro_rules! bson {
    ([$($val:tt),* $(,)?]) => {{
        #[allow(unused_mut)]
        let mut array = $crate::bson::Array::new();
        $(array.push($crate::bson::bson!($val));)*
        $crate::bson::Bson::Array(array)
    }};

    ({ $($key:tt : $val:tt),* $(,)? }) => {
        $crate::bson::Bson::Document($crate::bson::doc! { $($key: $val),* })
    };

    (null) => {
        $crate::bson::Bson::Null
    };

    ($val:expr) => {
        $crate::bson::Bson::from($val)
    };
}

/// Builds a [`Document`](crate::bson::Document) from `key: value` pairs.
///
/// ```
/// use mongowire::bson::doc;
///
/// let filter = doc! { "name": "a", "count": { "$gt": 5 } };
/// ```
#[macro_export]
macro_rules! doc {
    () => {
        $crate::bson::Document::new()
    };

    ( $($key:tt : $val:tt),* $(,)? ) => {{
        #[allow(unused_mut)]
        let mut document = $crate::bson::Document::new();
        $(document.insert($key, $crate::bson::bson!($val));)*
        document
    }};
}
