pub mod tensor_ext;
